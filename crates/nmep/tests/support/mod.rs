//! Shared harness for end-to-end tests over loopback TCP

#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use nmep::proto::Handshake;
use nmep::{Client, ClientConfig, ConnectedClient, LocalBind, Message, MessageHandler, Server, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Handler answering every message with whatever the closure returns
pub struct Reply<F>(pub F);

#[async_trait::async_trait]
impl<F> MessageHandler for Reply<F>
where
    F: Fn(&Message) -> Bytes + Send + Sync,
{
    async fn on_message(&self, server: &Server, client: &ConnectedClient, message: Message) -> nmep::Result<()> {
        let payload = (self.0)(&message);
        server.send_to(client.id, payload, message.id()).await
    }
}

/// Handler echoing every payload back
pub fn echo() -> Arc<dyn MessageHandler> {
    Arc::new(Reply(|message: &Message| message.payload().unwrap_or_default()))
}

/// Running server on an ephemeral loopback port
pub struct TestServer {
    pub server: Server,
    handler: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Bind, attach `handler` and start accepting
    pub async fn start(handler: Option<Arc<dyn MessageHandler>>) -> Result<Self> {
        init_tracing();

        let config = ServerConfig::new("127.0.0.1:0".parse()?).with_handshake_timeout(Duration::from_secs(1));
        let server = Server::bind(config).await?;
        let handler = match handler {
            Some(handler) => Some(server.spawn_handler(handler).await),
            None => None,
        };
        server.start().await?;
        Ok(Self { server, handler })
    }

    /// Connect a client with the given chunk size
    pub async fn client(&self, chunk_size: u16) -> Result<Client> {
        let config = ClientConfig::default()
            .with_chunk_size(chunk_size)
            .with_local_bind(LocalBind::Ephemeral);
        Ok(Client::connect(self.server.local_addr(), config).await?)
    }

    /// Open a raw socket that has already sent its handshake
    pub async fn raw(&self, chunk_size: u16) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server.local_addr()).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&Handshake::new(chunk_size).encode()).await?;
        Ok(stream)
    }

    /// Stop the handler and the server
    pub async fn cleanup(mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        self.server.stop().await;
    }
}
