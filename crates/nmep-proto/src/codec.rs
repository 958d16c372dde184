//! Chunk codec for async streams
//!
//! The wire format has no length prefix. Frame boundaries are recovered from
//! the negotiated chunk size and the trailing markers:
//!
//! - every non-final chunk is exactly `chunk_size` bytes long;
//! - a final chunk may be shorter, and ends on the final marker;
//! - chunks of one message are written back to back, so whatever follows a
//!   final chunk is the first chunk of another message (a leading kind,
//!   non-zero id, sequence 1).
//!
//! A short frame is cut at the first final marker that satisfies all three.
//! A read that stops exactly on a final-marker-valued data byte of a
//! full-size chunk is indistinguishable from a short final chunk and is cut
//! there. A short buffer that is itself a final frame is emitted whole even
//! when its data tail could open a new header.

use crate::chunk::{Chunk, PayloadKind, FINAL_MARKER, MIN_FRAME_LEN};
use crate::ProtocolError;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header bytes after the leading marker: id and sequence
const HEADER_LEN: usize = 5;

/// What follows a candidate short final frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextFrame {
    /// A complete header opening a new message
    Start,
    /// Too few bytes to tell, none contradicting a message start
    Undecided,
    /// Cannot be the start of a message
    Mismatch,
}

fn next_frame(rest: &[u8]) -> NextFrame {
    match rest.first().copied().and_then(PayloadKind::from_leading_marker) {
        Some(kind) if kind.is_leading() => {}
        Some(_) => return NextFrame::Mismatch,
        None if rest.is_empty() => return NextFrame::Undecided,
        None => return NextFrame::Mismatch,
    }

    if rest.len() >= 3 && rest[1] == 0 && rest[2] == 0 {
        return NextFrame::Mismatch;
    }
    // Sequence 1, little-endian
    if rest.get(3).is_some_and(|&b| b != 1) || rest.get(4).is_some_and(|&b| b != 0) {
        return NextFrame::Mismatch;
    }

    if rest.len() >= HEADER_LEN {
        NextFrame::Start
    } else {
        NextFrame::Undecided
    }
}

/// Header and trailing marker of a would-be final frame are well formed
fn is_final_frame(frame: &[u8]) -> bool {
    frame.len() >= MIN_FRAME_LEN
        && frame.last() == Some(&FINAL_MARKER)
        && PayloadKind::from_leading_marker(frame[0]).is_some()
        && frame[1..3] != [0, 0]
        && frame[3..5] != [0, 0]
}

/// Splits a byte stream into chunk frames and writes chunks back out
pub struct ChunkCodec {
    /// Bytes read but not yet emitted as a frame
    read_buf: BytesMut,
    /// Scratch space for a single read
    scratch: Vec<u8>,
    /// Negotiated chunk size
    chunk_size: usize,
}

impl ChunkCodec {
    /// Create a codec for a connection with the given chunk size
    pub fn new(chunk_size: u16) -> Self {
        let chunk_size = chunk_size as usize;
        Self {
            read_buf: BytesMut::with_capacity(2 * chunk_size),
            scratch: vec![0u8; chunk_size],
            chunk_size,
        }
    }

    /// Negotiated chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encode a chunk, refusing frames larger than the chunk size
    pub fn encode_chunk(&self, chunk: &Chunk) -> Result<Bytes, ProtocolError> {
        let size = chunk.encoded_len();
        if size > self.chunk_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.chunk_size,
            });
        }
        Ok(chunk.encode())
    }

    /// Write one chunk and flush
    pub async fn write_chunk<W>(&self, writer: &mut W, chunk: &Chunk) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_chunk(chunk)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next raw frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream. Bytes left over
    /// at end of stream are handed out as a last frame so the caller can
    /// report them as malformed.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_split_frame() {
                return Ok(Some(frame));
            }

            let n = reader.read(&mut self.scratch).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.read_buf.split().freeze()));
            }

            self.read_buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Split the leading frame off the internal buffer if its end is known
    pub fn try_split_frame(&mut self) -> Option<Bytes> {
        let len = self.read_buf.len();
        let full = len >= self.chunk_size;

        // Short final frames followed by more bytes
        for end in MIN_FRAME_LEN..len.min(self.chunk_size) {
            if self.read_buf[end - 1] != FINAL_MARKER || !is_final_frame(&self.read_buf[..end]) {
                continue;
            }
            match next_frame(&self.read_buf[end..]) {
                NextFrame::Start => return Some(self.read_buf.split_to(end).freeze()),
                NextFrame::Undecided if full => return Some(self.read_buf.split_to(end).freeze()),
                // The buffer as a whole is a final frame with marker bytes in its data
                NextFrame::Undecided if is_final_frame(&self.read_buf) => {
                    return Some(self.read_buf.split().freeze())
                }
                NextFrame::Undecided => return None,
                NextFrame::Mismatch => {}
            }
        }

        if full {
            return Some(self.read_buf.split_to(self.chunk_size).freeze());
        }

        // A short buffer ending on a well-formed final frame
        if is_final_frame(&self.read_buf) {
            return Some(self.read_buf.split().freeze());
        }
        None
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
