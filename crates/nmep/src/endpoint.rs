//! Per-connection receive loop and pending-message table
//!
//! An [`Endpoint`] owns the in-progress messages of one connection, keyed by
//! message id. Its [`ReceiveLoop`] keeps exactly one read outstanding, decodes
//! each frame, and hands completed messages either to a waiter registered by
//! the send path or to the owning layer's completion channel.

use crate::error::is_disconnect;
use crate::{NmepError, Result};
use nmep_proto::{next_message_id, Chunk, ChunkCodec, Message, ProtocolError};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Receive state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Between reads
    Idle,
    /// A read is outstanding
    ReceivePending,
    /// Peer closed the stream or the loop was cancelled; no further reads
    Closed,
}

/// What to do with a chunk whose message id has no pending entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownMessagePolicy {
    /// Start accumulating a new message (accepting side)
    Accumulate,
    /// Discard the chunk (initiating side)
    Drop,
}

/// In-progress message plus whoever is waiting for it
#[derive(Debug)]
struct PendingMessage {
    message: Message,
    waiter: Option<oneshot::Sender<Message>>,
}

/// Pending-message table and receive state for one connection
#[derive(Debug)]
pub struct Endpoint {
    chunk_size: u16,
    policy: UnknownMessagePolicy,
    /// Shared by the receive loop and the send path
    pending: Mutex<HashMap<u16, PendingMessage>>,
    state: watch::Sender<EndpointState>,
    shutdown: Notify,
}

impl Endpoint {
    /// Create an endpoint for a connection with the negotiated chunk size
    pub fn new(chunk_size: u16, policy: UnknownMessagePolicy) -> Arc<Self> {
        let (state, _) = watch::channel(EndpointState::Idle);
        Arc::new(Self {
            chunk_size,
            policy,
            pending: Mutex::new(HashMap::new()),
            state,
            shutdown: Notify::new(),
        })
    }

    /// Negotiated chunk size
    pub fn chunk_size(&self) -> u16 {
        self.chunk_size
    }

    /// Current receive state
    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    /// Watch receive state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: EndpointState) {
        self.state.send_replace(state);
    }

    /// Cancel the receive loop's outstanding read
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Number of in-progress messages
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether `id` has an in-progress entry
    pub async fn is_pending(&self, id: u16) -> bool {
        self.pending.lock().await.contains_key(&id)
    }

    /// Register an empty response slot for `id`.
    ///
    /// The returned receiver resolves once the message completes. There is no
    /// built-in deadline: if the peer never finishes the message, or the
    /// connection closes, the receiver stays pending.
    pub async fn expect_response(&self, id: u16) -> Result<oneshot::Receiver<Message>> {
        let mut pending = self.pending.lock().await;
        match pending.entry(id) {
            Entry::Occupied(_) => Err(NmepError::IdentifierInUse(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingMessage {
                    message: Message::incoming(id),
                    waiter: Some(tx),
                });
                Ok(rx)
            }
        }
    }

    /// Allocate a fresh message id and register a response slot for it.
    ///
    /// Ids still pending on this connection are skipped.
    pub async fn allocate_response(&self) -> Result<(u16, oneshot::Receiver<Message>)> {
        let mut pending = self.pending.lock().await;
        for _ in 0..u16::MAX {
            let id = next_message_id();
            if let Entry::Vacant(slot) = pending.entry(id) {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingMessage {
                    message: Message::incoming(id),
                    waiter: Some(tx),
                });
                return Ok((id, rx));
            }
        }
        Err(NmepError::IdentifierSpaceExhausted)
    }

    /// Remove the entry for `id`, returning whether one existed
    pub async fn forget(&self, id: u16) -> bool {
        self.pending.lock().await.remove(&id).is_some()
    }

    /// Route one decoded chunk to its message.
    ///
    /// A message that completes is removed from the table. If a waiter was
    /// registered it receives the message and `None` is returned; otherwise
    /// the message is returned for the owning layer.
    pub async fn dispatch(&self, chunk: Chunk) -> Option<Message> {
        let id = chunk.message_id();
        let completed = {
            let mut pending = self.pending.lock().await;
            let entry = match pending.entry(id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(slot) => match self.policy {
                    UnknownMessagePolicy::Accumulate => {
                        debug!("Accumulating new message {}", id);
                        slot.insert(PendingMessage {
                            message: Message::incoming(id),
                            waiter: None,
                        })
                    }
                    UnknownMessagePolicy::Drop => {
                        debug!("Dropping chunk {} of unknown message {}", chunk.sequence(), id);
                        return None;
                    }
                },
            };

            entry.message.add(chunk);
            if !entry.message.is_complete() {
                return None;
            }
            pending.remove(&id)?
        };

        debug!("Message {} complete ({} chunk(s))", id, completed.message.len());
        match completed.waiter {
            Some(waiter) => {
                if waiter.send(completed.message).is_err() {
                    debug!("Waiter for message {} is gone", id);
                }
                None
            }
            None => Some(completed.message),
        }
    }
}

/// Continuous receive loop of one connection
pub struct ReceiveLoop<R> {
    endpoint: Arc<Endpoint>,
    reader: R,
    codec: ChunkCodec,
    completions: Option<mpsc::UnboundedSender<Message>>,
}

impl<R> ReceiveLoop<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a loop reading from `reader` on behalf of `endpoint`
    pub fn new(endpoint: Arc<Endpoint>, reader: R) -> Self {
        let codec = ChunkCodec::new(endpoint.chunk_size());
        Self {
            endpoint,
            reader,
            codec,
            completions: None,
        }
    }

    /// Forward completed messages without a waiter to `completions`
    pub fn with_completions(mut self, completions: mpsc::UnboundedSender<Message>) -> Self {
        self.completions = Some(completions);
        self
    }

    /// Run until the peer closes the stream or the endpoint is closed.
    ///
    /// Malformed frames are logged and skipped; they do not end the loop.
    pub async fn run(mut self) {
        debug!("Starting receive loop (chunk size {})", self.endpoint.chunk_size());

        loop {
            self.endpoint.set_state(EndpointState::ReceivePending);

            let frame = tokio::select! {
                _ = self.endpoint.shutdown.notified() => {
                    debug!("Receive loop cancelled");
                    break;
                }
                result = self.codec.read_frame(&mut self.reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!("Peer closed the connection");
                        break;
                    }
                    Err(ProtocolError::Io(e)) if is_disconnect(&e) => {
                        debug!("Connection closed: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!("Receive failed: {}", e);
                        break;
                    }
                }
            };

            self.endpoint.set_state(EndpointState::Idle);

            match Chunk::decode(&frame) {
                Ok(chunk) => {
                    if let Some(message) = self.endpoint.dispatch(chunk).await {
                        self.complete(message);
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed frame ({} bytes): {}", frame.len(), e);
                }
            }
        }

        self.endpoint.set_state(EndpointState::Closed);
        info!("Receive loop stopped");
    }

    fn complete(&self, message: Message) {
        match &self.completions {
            Some(completions) => {
                if completions.send(message).is_err() {
                    debug!("Completion observer is gone");
                }
            }
            None => debug!("No observer for completed message {}", message.id()),
        }
    }
}
