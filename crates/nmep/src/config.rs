//! Server and client configuration

use crate::{NmepError, Result};
use nmep_proto::{ProtocolError, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, MIN_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: SocketAddr,
    /// How long the accept loop waits for a handshake preamble
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Configuration listening on `bind_addr`
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the listening port, keeping the address
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Local address selection for the client socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalBind {
    /// Let the OS pick a port
    Ephemeral,
    /// Bind this exact port
    Port(u16),
    /// Bind the server's port plus one
    ServerPortPlusOne,
}

impl LocalBind {
    /// Local socket address for a connection to `server`
    pub fn resolve(self, server: SocketAddr) -> Result<SocketAddr> {
        let ip = match server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let port = match self {
            Self::Ephemeral => 0,
            Self::Port(port) => port,
            Self::ServerPortPlusOne => server.port().checked_add(1).ok_or_else(|| {
                NmepError::Configuration(format!("No port above server port {}", server.port()))
            })?,
        };
        Ok(SocketAddr::new(ip, port))
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Chunk size requested in the handshake and used for outgoing messages
    pub chunk_size: u16,
    /// Local socket binding
    pub local_bind: LocalBind,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            local_bind: LocalBind::ServerPortPlusOne,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: u16) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the local binding
    pub fn with_local_bind(mut self, local_bind: LocalBind) -> Self {
        self.local_bind = local_bind;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reject chunk sizes that cannot carry data
    pub fn validate(&self) -> Result<()> {
        if (self.chunk_size as usize) < MIN_CHUNK_SIZE {
            return Err(ProtocolError::ChunkSizeTooSmall {
                size: self.chunk_size as usize,
                min: MIN_CHUNK_SIZE,
            }
            .into());
        }
        Ok(())
    }
}
