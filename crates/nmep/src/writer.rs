//! Serialized outgoing writes
//!
//! All sends on a connection go through one [`ChunkWriter`]. The write half
//! sits behind a single lock that is held for a message's entire chunk
//! sequence, so concurrent sends never interleave their chunks on the wire.

use crate::error::is_disconnect;
use crate::{NmepError, Result};
use nmep_proto::{ChunkCodec, Message, ProtocolError};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Type-erased write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable handle writing whole messages to one connection
#[derive(Clone)]
pub struct ChunkWriter {
    /// `None` once the connection has been shut down
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    codec: Arc<ChunkCodec>,
}

impl ChunkWriter {
    /// Wrap a write half for a connection using `chunk_size`
    pub fn new<W>(writer: W, chunk_size: u16) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Some(Box::new(writer)))),
            codec: Arc::new(ChunkCodec::new(chunk_size)),
        }
    }

    /// Write every chunk of `message` in sequence order.
    ///
    /// Each chunk is written and flushed before the next one starts.
    pub async fn write_message(&self, message: &Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NmepError::ConnectionClosed)?;

        for chunk in message.chunks() {
            if let Err(e) = self.codec.write_chunk(writer, chunk).await {
                if let ProtocolError::Io(io) = &e {
                    if is_disconnect(io) {
                        debug!("Peer went away while writing message {}", message.id());
                        *guard = None;
                        return Err(NmepError::ConnectionClosed);
                    }
                }
                return Err(e.into());
            }
        }

        debug!("Sent message {} in {} chunk(s)", message.id(), message.len());
        Ok(())
    }

    /// Shut the write half down; later writes fail with `ConnectionClosed`
    pub async fn shutdown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                if !is_disconnect(&e) {
                    warn!("Failed to shut down writer: {}", e);
                }
            }
        }
    }

    /// Whether the writer has been shut down
    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}
