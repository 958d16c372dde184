//! Message fragmentation and reassembly
//!
//! A [`Message`] is either built eagerly from a full payload (sender side) or
//! accumulated chunk by chunk from the network (receiver side).

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Bytes, BytesMut};
use crate::chunk::{Chunk, PayloadKind, MIN_FRAME_LEN};
use crate::ProtocolError;

/// Smallest chunk size that still carries one byte of data
pub const MIN_CHUNK_SIZE: usize = MIN_FRAME_LEN + 1;

static LAST_MESSAGE_ID: AtomicU16 = AtomicU16::new(0);

/// Allocate the next message identifier from the process-wide counter.
///
/// Never returns 0; after 65535 the counter wraps to 1.
pub fn next_message_id() -> u16 {
    loop {
        let id = LAST_MESSAGE_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

/// A logical payload made of one or more chunks sharing an identifier
#[derive(Debug, Clone)]
pub struct Message {
    id: u16,
    /// Kept sorted by sequence number
    chunks: Vec<Chunk>,
    completed: bool,
}

impl Message {
    /// Split `payload` into a ready-to-send chunk sequence.
    ///
    /// `id == 0` allocates a fresh identifier with [`next_message_id`]. Each
    /// chunk carries at most `chunk_size - MIN_FRAME_LEN` data bytes; the first
    /// chunk is tagged with `kind`, the rest are continuations, and the last one
    /// is marked final. An empty payload yields a single empty final chunk.
    pub fn outgoing(
        payload: impl Into<Bytes>,
        kind: PayloadKind,
        chunk_size: u16,
        id: u16,
    ) -> Result<Self, ProtocolError> {
        let chunk_size = chunk_size as usize;
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(ProtocolError::ChunkSizeTooSmall {
                size: chunk_size,
                min: MIN_CHUNK_SIZE,
            });
        }
        if !kind.is_leading() {
            return Err(ProtocolError::InvalidKind(kind));
        }

        let payload = payload.into();
        let data_per_chunk = chunk_size - MIN_FRAME_LEN;
        let max = data_per_chunk * u16::MAX as usize;
        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max });
        }

        let id = if id == 0 { next_message_id() } else { id };
        let count = payload.len().div_ceil(data_per_chunk).max(1);
        let mut chunks = Vec::with_capacity(count);

        for index in 0..count {
            let start = index * data_per_chunk;
            let end = (start + data_per_chunk).min(payload.len());
            let chunk_kind = if index == 0 { kind } else { PayloadKind::Continuation };
            chunks.push(Chunk::new(
                chunk_kind,
                id,
                (index + 1) as u16,
                payload.slice(start..end),
                index + 1 == count,
            ));
        }

        Ok(Self {
            id,
            chunks,
            completed: true,
        })
    }

    /// Empty message bound to `id`, waiting for chunks from the network
    pub fn incoming(id: u16) -> Self {
        Self {
            id,
            chunks: Vec::new(),
            completed: false,
        }
    }

    /// Message identifier
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Chunks in sequence-number order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of chunks held
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when no chunk has been added yet
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Kind of the leading chunk, if it has arrived
    pub fn kind(&self) -> Option<PayloadKind> {
        self.chunks
            .first()
            .filter(|chunk| chunk.sequence() == 1)
            .map(Chunk::kind)
    }

    /// Whether the chunk set has ever passed [`Message::check`].
    ///
    /// Flips to true on the first successful `add` and stays there.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Add a chunk received for this message.
    ///
    /// Returns false without touching the message when the chunk belongs to
    /// another identifier. Callers stop adding once the message is complete.
    pub fn add(&mut self, chunk: Chunk) -> bool {
        if chunk.message_id() != self.id {
            return false;
        }

        let position = self.chunks.partition_point(|c| c.sequence() <= chunk.sequence());
        self.chunks.insert(position, chunk);

        if !self.completed && self.check() {
            self.completed = true;
        }
        true
    }

    /// Validate the chunk set.
    ///
    /// Sequence numbers must run 1..=N without gaps or duplicates, only the
    /// first chunk may carry a leading kind, and only the last one may be final.
    pub fn check(&self) -> bool {
        if self.id == 0 || self.chunks.is_empty() {
            return false;
        }

        let last = self.chunks.len() - 1;
        self.chunks.iter().enumerate().all(|(index, chunk)| {
            chunk.message_id() == self.id
                && chunk.sequence() as usize == index + 1
                && chunk.kind().is_leading() == (index == 0)
                && chunk.is_final() == (index == last)
        })
    }

    /// Concatenated data of a valid chunk set; `None` otherwise
    pub fn payload(&self) -> Option<Bytes> {
        if !self.check() {
            return None;
        }

        if let [only] = self.chunks.as_slice() {
            return Some(only.data().clone());
        }

        let size = self.chunks.iter().map(|chunk| chunk.data().len()).sum();
        let mut buf = BytesMut::with_capacity(size);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk.data());
        }
        Some(buf.freeze())
    }
}
