//! Error types for protocol operations

use thiserror::Error;
use crate::chunk::PayloadKind;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the fixed frame overhead
    #[error("Frame too short: {len} bytes (min: {min})")]
    FrameTooShort {
        /// Actual frame length
        len: usize,
        /// Minimum frame length
        min: usize,
    },

    /// Frame bytes violate the chunk format
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Encoded frame exceeds the negotiated chunk size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Chunk size cannot carry a single byte of data
    #[error("Chunk size too small: {size} bytes (min: {min})")]
    ChunkSizeTooSmall {
        /// Requested chunk size
        size: usize,
        /// Minimum viable chunk size
        min: usize,
    },

    /// Payload needs more chunks than the sequence field can number
    #[error("Payload too large: {size} bytes (max: {max} at this chunk size)")]
    PayloadTooLarge {
        /// Payload length
        size: usize,
        /// Largest payload the chunk size allows
        max: usize,
    },

    /// Payload kind cannot lead a message
    #[error("Invalid payload kind for a leading chunk: {0:?}")]
    InvalidKind(PayloadKind),

    /// Handshake signature or version mismatch
    #[error("Handshake rejected: signature {signature:#04x}, version {version:#04x}")]
    HandshakeRejected {
        /// Received signature byte
        signature: u8,
        /// Received protocol version byte
        version: u8,
    },

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for errors raised while decoding a received frame
    pub fn is_malformed_frame(&self) -> bool {
        matches!(self, Self::FrameTooShort { .. } | Self::InvalidFrame(_))
    }

    /// True for errors caused by a bad chunk size or payload kind at construction time
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ChunkSizeTooSmall { .. } | Self::InvalidKind(_) | Self::PayloadTooLarge { .. }
        )
    }
}
