//! # NMEP
//!
//! Chunked request/response messaging over TCP.
//!
//! A [`Server`] accepts connections, reads a short handshake that fixes the
//! chunk size, and reassembles the chunks each client sends into whole
//! [`Message`]s. A [`Client`] sends a payload and waits for the server's reply
//! carrying the same message id.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use nmep_proto as proto;

/// Error types for the NMEP library
pub mod error;

/// Server and client configuration
pub mod config;

/// Per-connection receive loop and pending-message table
pub mod endpoint;

/// Serialized outgoing writes
pub mod writer;

/// Accepting side: listener, connection registry and events
pub mod server;

/// Initiating side: connect, send and await the reply
pub mod client;

/// Blocking wrapper around [`Client`]
pub mod blocking;

pub use error::NmepError;
pub use config::{ClientConfig, LocalBind, ServerConfig};
pub use endpoint::{Endpoint, EndpointState, ReceiveLoop, UnknownMessagePolicy};
pub use writer::ChunkWriter;
pub use server::{ConnectedClient, ConnectionId, MessageHandler, Server, ServerEvent};
pub use client::Client;
pub use blocking::BlockingClient;
pub use proto::{Message, PayloadKind};

/// Result type alias for NMEP operations
pub type Result<T> = std::result::Result<T, NmepError>;
