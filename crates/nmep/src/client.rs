//! Initiating side: connect, send and await the reply

use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, EndpointState, ReceiveLoop, UnknownMessagePolicy};
use crate::writer::ChunkWriter;
use crate::{NmepError, Result};
use bytes::Bytes;
use nmep_proto::{Handshake, Message, PayloadKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection to an NMEP server
pub struct Client {
    endpoint: Arc<Endpoint>,
    writer: ChunkWriter,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Client {
    /// Connect, send the handshake and start receiving.
    ///
    /// The chunk size is checked before any socket is opened.
    pub async fn connect(server_addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let local = config.local_bind.resolve(server_addr)?;
        let socket = match server_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;

        info!("Connecting to {} from {}", server_addr, local);
        let duration = config.connect_timeout;
        let mut stream = tokio::time::timeout(duration, socket.connect(server_addr))
            .await
            .map_err(|_| NmepError::Timeout { duration })??;
        stream.set_nodelay(true)?;

        stream.write_all(&Handshake::new(config.chunk_size).encode()).await?;
        stream.flush().await?;

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let endpoint = Endpoint::new(config.chunk_size, UnknownMessagePolicy::Drop);
        let receive_task = tokio::spawn(ReceiveLoop::new(endpoint.clone(), reader).run());
        info!("Connected to {} (chunk size {})", peer_addr, config.chunk_size);

        Ok(Self {
            endpoint,
            writer: ChunkWriter::new(writer, config.chunk_size),
            receive_task: Mutex::new(Some(receive_task)),
            local_addr,
            peer_addr,
        })
    }

    /// Send a text payload and wait for the reply with the same message id.
    ///
    /// There is no deadline. If the server never completes its reply, or the
    /// connection closes first, this never resolves; use
    /// [`Client::send_with_timeout`] to bound the wait.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<Message> {
        self.send_kind(PayloadKind::Text, payload).await
    }

    /// Send a payload of the given kind and wait for the reply
    pub async fn send_kind(&self, kind: PayloadKind, payload: impl Into<Bytes>) -> Result<Message> {
        let (_, response) = self.begin(kind, payload.into()).await?;
        response.await.map_err(|_| NmepError::ConnectionClosed)
    }

    /// Like [`Client::send`], giving up after `duration`.
    ///
    /// On timeout the response slot is released, so a late reply is dropped.
    pub async fn send_with_timeout(&self, payload: impl Into<Bytes>, duration: Duration) -> Result<Message> {
        let (id, response) = self.begin(PayloadKind::Text, payload.into()).await?;
        match tokio::time::timeout(duration, response).await {
            Ok(result) => result.map_err(|_| NmepError::ConnectionClosed),
            Err(_) => {
                warn!("No reply to message {} within {:?}", id, duration);
                self.endpoint.forget(id).await;
                Err(NmepError::Timeout { duration })
            }
        }
    }

    /// Register the response slot, then write the request
    async fn begin(&self, kind: PayloadKind, payload: Bytes) -> Result<(u16, oneshot::Receiver<Message>)> {
        let (id, response) = self.endpoint.allocate_response().await?;

        let message = match Message::outgoing(payload, kind, self.endpoint.chunk_size(), id) {
            Ok(message) => message,
            Err(e) => {
                self.endpoint.forget(id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.writer.write_message(&message).await {
            self.endpoint.forget(id).await;
            return Err(e);
        }

        debug!("Awaiting reply to message {}", id);
        Ok((id, response))
    }

    /// Cancel the receive loop and shut the connection down
    pub async fn close(&self) {
        debug!("Closing connection to {}", self.peer_addr);
        self.endpoint.close();
        self.writer.shutdown().await;

        if let Some(task) = self.receive_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Receive task failed: {}", e);
            }
        }
    }

    /// Receive state of the connection
    pub fn state(&self) -> EndpointState {
        self.endpoint.state()
    }

    /// Number of sends still waiting for a reply
    pub async fn pending_count(&self) -> usize {
        self.endpoint.pending_count().await
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Negotiated chunk size
    pub fn chunk_size(&self) -> u16 {
        self.endpoint.chunk_size()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.endpoint.close();
    }
}

#[cfg(test)]
mod tests;
