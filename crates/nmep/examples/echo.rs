//! Echo round trip: one server, one client, a few messages of growing size.
//!
//! Run with `RUST_LOG=debug` to watch the chunk traffic.

use anyhow::Result;
use nmep::{Client, ClientConfig, ConnectedClient, LocalBind, Message, MessageHandler, Server, ServerConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Echo;

#[async_trait::async_trait]
impl MessageHandler for Echo {
    async fn on_message(&self, server: &Server, client: &ConnectedClient, message: Message) -> nmep::Result<()> {
        let payload = message.payload().unwrap_or_default();
        info!("Echoing {} bytes to client {}", payload.len(), client.id);
        server.send_to(client.id, payload, message.id()).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = Server::bind(ServerConfig::new("127.0.0.1:0".parse()?)).await?;
    server.spawn_handler(Arc::new(Echo)).await;
    server.start().await?;

    let config = ClientConfig::default().with_local_bind(LocalBind::Ephemeral);
    let client = Client::connect(server.local_addr(), config).await?;

    for size in [1usize, 1018, 2048, 10_000] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let reply = client.send(payload.clone()).await?;
        info!(
            "Sent {} bytes, got {} bytes back in {} chunk(s), intact: {}",
            size,
            reply.payload().map_or(0, |p| p.len()),
            reply.len(),
            reply.payload().as_deref() == Some(payload.as_slice())
        );
    }

    client.close().await;
    server.stop().await;
    Ok(())
}
