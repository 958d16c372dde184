//! # NMEP Protocol
//!
//! Chunk wire format, message fragmentation/reassembly and the connection
//! handshake for the NMEP messaging protocol.

#![warn(missing_docs)]

/// Single wire chunk and its encode/decode rules
pub mod chunk;

/// Message fragmentation and reassembly
pub mod message;

/// Connection handshake preamble
pub mod handshake;

/// Chunk framing over async byte streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use chunk::{Chunk, PayloadKind, MIN_FRAME_LEN};
pub use message::{next_message_id, Message, MIN_CHUNK_SIZE};
pub use handshake::{Handshake, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, HANDSHAKE_LEN};
pub use codec::ChunkCodec;
pub use error::ProtocolError;
