//! Accepting side: listener, connection registry and events

use crate::config::ServerConfig;
use crate::endpoint::{Endpoint, ReceiveLoop, UnknownMessagePolicy};
use crate::writer::ChunkWriter;
use crate::{NmepError, Result};
use bytes::Bytes;
use nmep_proto::{Handshake, Message, PayloadKind, HANDSHAKE_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Server-local connection identity, assigned sequentially from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Application-facing handle of an accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedClient {
    /// Connection identity
    pub id: ConnectionId,
    /// Chunk size the client asked for in its handshake
    pub chunk_size: u16,
    /// Remote address
    pub peer_addr: SocketAddr,
}

/// Server-level notifications
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed its handshake
    Connected(ConnectedClient),
    /// A client finished sending a message
    MessageReceived {
        /// Sending client
        client: ConnectedClient,
        /// The reassembled message
        message: Message,
    },
    /// A client's receive loop ended and it left the registry
    Disconnected(ConnectedClient),
}

/// Callback for completed messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message; `server` can be used to reply
    async fn on_message(&self, server: &Server, client: &ConnectedClient, message: Message) -> Result<()>;
}

/// Registry entry for one connection
struct ClientEntry {
    writer: ChunkWriter,
    endpoint: Arc<Endpoint>,
    receive_task: JoinHandle<()>,
}

struct ServerInner {
    config: ServerConfig,
    local_addr: SocketAddr,
    /// Taken by `start`
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    clients: RwLock<HashMap<ConnectionId, ClientEntry>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>,
    next_connection_id: AtomicU32,
}

/// NMEP server
///
/// Cloning is cheap; every clone drives the same listener and registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind the listening socket. Nothing is accepted until [`Server::start`].
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("Bound listener on {}", local_addr);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                local_addr,
                listener: Mutex::new(Some(listener)),
                accept_task: Mutex::new(None),
                clients: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                next_connection_id: AtomicU32::new(1),
            }),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Spawn the accept loop
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| NmepError::Configuration("Server already started".to_string()))?;

        let server = self.clone();
        let task = tokio::spawn(async move { server.accept_loop(listener).await });
        *self.inner.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Stop accepting, close every connection and clear the registry
    pub async fn stop(&self) {
        debug!("Shutting down server");

        if let Some(task) = self.inner.accept_task.lock().await.take() {
            task.abort();
        }

        let entries: Vec<(ConnectionId, ClientEntry)> = self.inner.clients.write().await.drain().collect();
        for (id, entry) in entries {
            entry.endpoint.close();
            entry.writer.shutdown().await;
            if let Err(e) = entry.receive_task.await {
                warn!("Receive task for client {} failed: {}", id, e);
            }
        }

        info!("Server shutdown complete");
    }

    /// Receive every event raised from now on
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().await.push(tx);
        rx
    }

    /// Drive `handler` with every received message.
    ///
    /// Messages are handled one at a time in arrival order. Abort the returned
    /// task to stop handling.
    pub async fn spawn_handler(&self, handler: Arc<dyn MessageHandler>) -> JoinHandle<()> {
        let mut events = self.subscribe().await;
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ServerEvent::MessageReceived { client, message } = event {
                    let id = message.id();
                    if let Err(e) = handler.on_message(&server, &client, message).await {
                        error!("Handler failed for message {} from client {}: {}", id, client.id, e);
                    }
                }
            }
        })
    }

    /// Send a text payload to `client` under `message_id`
    pub async fn send_to(&self, client: ConnectionId, payload: impl Into<Bytes>, message_id: u16) -> Result<()> {
        self.send_kind_to(client, PayloadKind::Text, payload, message_id).await
    }

    /// Send a payload of the given kind to `client` under `message_id`.
    ///
    /// The message is split with the client's negotiated chunk size and its
    /// chunks are written in sequence order without interleaving other sends.
    pub async fn send_kind_to(
        &self,
        client: ConnectionId,
        kind: PayloadKind,
        payload: impl Into<Bytes>,
        message_id: u16,
    ) -> Result<()> {
        let (writer, chunk_size) = {
            let clients = self.inner.clients.read().await;
            let entry = clients.get(&client).ok_or(NmepError::UnknownConnection(client.0))?;
            (entry.writer.clone(), entry.endpoint.chunk_size())
        };

        let message = Message::outgoing(payload, kind, chunk_size, message_id)?;
        writer.write_message(&message).await
    }

    /// Number of registered connections
    pub async fn connection_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    /// Identities of registered connections
    pub async fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.inner.clients.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn accept_loop(self, listener: TcpListener) {
        info!("Listening on {}", self.inner.local_addr);

        loop {
            let (mut stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer_addr);

            match self.read_handshake(&mut stream).await {
                Ok(handshake) => self.register(stream, peer_addr, handshake.chunk_size).await,
                // Dropping the stream closes it without a reply
                Err(e) => warn!("Rejected connection from {}: {}", peer_addr, e),
            }
        }
    }

    async fn read_handshake(&self, stream: &mut TcpStream) -> Result<Handshake> {
        let duration = self.inner.config.handshake_timeout;
        let mut preamble = [0u8; HANDSHAKE_LEN];

        tokio::time::timeout(duration, stream.read_exact(&mut preamble))
            .await
            .map_err(|_| NmepError::Timeout { duration })??;

        Ok(Handshake::decode(&preamble)?)
    }

    async fn register(&self, stream: TcpStream, peer_addr: SocketAddr, chunk_size: u16) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let id = ConnectionId(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let client = ConnectedClient {
            id,
            chunk_size,
            peer_addr,
        };

        let (reader, writer) = stream.into_split();
        let endpoint = Endpoint::new(chunk_size, UnknownMessagePolicy::Accumulate);
        let (completions_tx, mut completions) = mpsc::unbounded_channel();
        let receive_task = tokio::spawn(
            ReceiveLoop::new(endpoint.clone(), reader)
                .with_completions(completions_tx)
                .run(),
        );

        self.inner.clients.write().await.insert(
            id,
            ClientEntry {
                writer: ChunkWriter::new(writer, chunk_size),
                endpoint,
                receive_task,
            },
        );
        info!("Client {} connected from {} (chunk size {})", id, peer_addr, chunk_size);
        self.publish(ServerEvent::Connected(client.clone())).await;

        // Re-publish this connection's completions at server level
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(message) = completions.recv().await {
                debug!("Message {} received from client {}", message.id(), client.id);
                server
                    .publish(ServerEvent::MessageReceived {
                        client: client.clone(),
                        message,
                    })
                    .await;
            }

            server.unregister(client.id).await;
            info!("Client {} disconnected", client.id);
            server.publish(ServerEvent::Disconnected(client)).await;
        });
    }

    async fn unregister(&self, id: ConnectionId) {
        let entry = self.inner.clients.write().await.remove(&id);
        if let Some(entry) = entry {
            entry.writer.shutdown().await;
        }
    }

    async fn publish(&self, event: ServerEvent) {
        let mut subscribers = self.inner.subscribers.lock().await;
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests;
