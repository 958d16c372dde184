//! Chunk structure and wire encoding
//!
//! Wire layout of one chunk:
//!
//! ```text
//! +--------+------------+----------+---------------+---------+
//! | lead   | message id | sequence | data          | trail   |
//! | 1 byte | u16 LE     | u16 LE   | len - 6 bytes | 1 byte  |
//! +--------+------------+----------+---------------+---------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use crate::ProtocolError;

/// Fixed per-chunk overhead: two markers and two u16 fields
pub const MIN_FRAME_LEN: usize = 2 * std::mem::size_of::<u8>() + 2 * std::mem::size_of::<u16>();

const CONTINUATION_MARKER: u8 = 0xE1;
const TEXT_MARKER: u8 = 0xE2;
const MARKUP_MARKER: u8 = 0xE3;
const FILE_MARKER: u8 = 0xE4;

pub(crate) const MORE_MARKER: u8 = 0xF1;
pub(crate) const FINAL_MARKER: u8 = 0xF2;

/// Payload kind carried by a chunk's leading marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    /// Plain text payload
    Text,
    /// Structured markup payload
    Markup,
    /// File contents
    File,
    /// Non-leading chunk of a multi-chunk message
    Continuation,
}

impl PayloadKind {
    /// Leading marker byte for this kind
    pub fn leading_marker(self) -> u8 {
        match self {
            Self::Text => TEXT_MARKER,
            Self::Markup => MARKUP_MARKER,
            Self::File => FILE_MARKER,
            Self::Continuation => CONTINUATION_MARKER,
        }
    }

    /// Map a leading marker byte back to its kind
    pub fn from_leading_marker(marker: u8) -> Option<Self> {
        match marker {
            TEXT_MARKER => Some(Self::Text),
            MARKUP_MARKER => Some(Self::Markup),
            FILE_MARKER => Some(Self::File),
            CONTINUATION_MARKER => Some(Self::Continuation),
            _ => None,
        }
    }

    /// Whether this kind may open a message
    pub fn is_leading(self) -> bool {
        !matches!(self, Self::Continuation)
    }
}

/// One wire frame carrying a fragment of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    kind: PayloadKind,
    message_id: u16,
    sequence: u16,
    data: Bytes,
    is_final: bool,
}

impl Chunk {
    /// Build a chunk for sending.
    ///
    /// Identifier and sequence are taken as given; use [`Chunk::check`] to
    /// validate them.
    pub fn new(
        kind: PayloadKind,
        message_id: u16,
        sequence: u16,
        data: impl Into<Bytes>,
        is_final: bool,
    ) -> Self {
        Self {
            kind,
            message_id,
            sequence,
            data: data.into(),
            is_final,
        }
    }

    /// Payload kind of this chunk
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Message identifier
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// 1-based position of this chunk within its message
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Data segment
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Whether this chunk closes its message
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Identifier and sequence number must both be non-zero
    pub fn check(&self) -> bool {
        self.message_id != 0 && self.sequence != 0
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.data.len()
    }

    /// Append the wire form to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.kind.leading_marker());
        buf.put_u16_le(self.message_id);
        buf.put_u16_le(self.sequence);
        buf.put_slice(&self.data);
        buf.put_u8(if self.is_final { FINAL_MARKER } else { MORE_MARKER });
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode and validate one frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(ProtocolError::FrameTooShort {
                len: frame.len(),
                min: MIN_FRAME_LEN,
            });
        }

        let last = frame.len() - 1;
        let kind = PayloadKind::from_leading_marker(frame[0])
            .ok_or(ProtocolError::InvalidFrame("unrecognized leading marker"))?;
        let is_final = match frame[last] {
            FINAL_MARKER => true,
            MORE_MARKER => false,
            _ => return Err(ProtocolError::InvalidFrame("unrecognized trailing marker")),
        };

        let message_id = u16::from_le_bytes([frame[1], frame[2]]);
        let sequence = u16::from_le_bytes([frame[3], frame[4]]);
        if message_id == 0 {
            return Err(ProtocolError::InvalidFrame("zero message id"));
        }
        if sequence == 0 {
            return Err(ProtocolError::InvalidFrame("zero sequence number"));
        }

        Ok(Self {
            kind,
            message_id,
            sequence,
            data: Bytes::copy_from_slice(&frame[5..last]),
            is_final,
        })
    }
}
