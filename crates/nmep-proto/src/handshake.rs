//! Connection handshake preamble
//!
//! Sent once by the connecting side right after the transport connects:
//! signature byte, protocol version byte, requested chunk size (u16 LE).
//! There is no acknowledgment; the server either keeps the connection or
//! closes it.

use crate::message::MIN_CHUNK_SIZE;
use crate::ProtocolError;

/// Handshake signature byte
pub const HANDSHAKE_SIGNATURE: u8 = 0xEA;

/// Protocol version spoken by this crate
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Length of the handshake preamble
pub const HANDSHAKE_LEN: usize = 2 * std::mem::size_of::<u8>() + std::mem::size_of::<u16>();

/// Chunk size requested when none is configured
pub const DEFAULT_CHUNK_SIZE: u16 = 1024;

/// Well-known server port
pub const DEFAULT_PORT: u16 = 777;

/// Handshake preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Chunk size the connecting side wants for this connection
    pub chunk_size: u16,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Handshake {
    /// Create a handshake requesting `chunk_size`
    pub fn new(chunk_size: u16) -> Self {
        Self { chunk_size }
    }

    /// Encode to the fixed 4-byte preamble
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let size = self.chunk_size.to_le_bytes();
        [HANDSHAKE_SIGNATURE, PROTOCOL_VERSION, size[0], size[1]]
    }

    /// Decode and validate a received preamble
    pub fn decode(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, ProtocolError> {
        let [signature, version, lo, hi] = *bytes;
        if signature != HANDSHAKE_SIGNATURE || version != PROTOCOL_VERSION {
            return Err(ProtocolError::HandshakeRejected { signature, version });
        }

        let chunk_size = u16::from_le_bytes([lo, hi]);
        if (chunk_size as usize) < MIN_CHUNK_SIZE {
            return Err(ProtocolError::ChunkSizeTooSmall {
                size: chunk_size as usize,
                min: MIN_CHUNK_SIZE,
            });
        }

        Ok(Self { chunk_size })
    }
}
