//! Blocking wrapper around [`Client`]
//!
//! For callers without their own async runtime. Every call parks the calling
//! thread until the underlying async operation finishes. Do not use these
//! types from inside a tokio runtime.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::endpoint::EndpointState;
use crate::Result;
use bytes::Bytes;
use nmep_proto::{Message, PayloadKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Synchronous NMEP client with a private runtime
pub struct BlockingClient {
    // Dropped before the runtime that drives it
    client: Client,
    runtime: Runtime,
}

impl BlockingClient {
    /// Connect, blocking until the handshake has been written
    pub fn connect(server_addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("nmep-client")
            .enable_all()
            .build()?;
        let client = runtime.block_on(Client::connect(server_addr, config))?;
        Ok(Self { client, runtime })
    }

    /// Send a text payload and block until the reply arrives
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<Message> {
        self.runtime.block_on(self.client.send(payload))
    }

    /// Send a payload of the given kind and block until the reply arrives
    pub fn send_kind(&self, kind: PayloadKind, payload: impl Into<Bytes>) -> Result<Message> {
        self.runtime.block_on(self.client.send_kind(kind, payload))
    }

    /// Send and block for at most `duration`
    pub fn send_with_timeout(&self, payload: impl Into<Bytes>, duration: Duration) -> Result<Message> {
        self.runtime.block_on(self.client.send_with_timeout(payload, duration))
    }

    /// Close the connection
    pub fn close(&self) {
        self.runtime.block_on(self.client.close())
    }

    /// Receive state of the connection
    pub fn state(&self) -> EndpointState {
        self.client.state()
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.client.local_addr()
    }

    /// Server address
    pub fn peer_addr(&self) -> SocketAddr {
        self.client.peer_addr()
    }

    /// Negotiated chunk size
    pub fn chunk_size(&self) -> u16 {
        self.client.chunk_size()
    }
}
