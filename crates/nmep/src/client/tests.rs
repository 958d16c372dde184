//! Unit tests for the initiating side against an in-process server

use super::*;
use crate::config::{LocalBind, ServerConfig};
use crate::server::{ConnectedClient, MessageHandler, Server};
use nmep_proto::ProtocolError;

struct Reverse;

#[async_trait::async_trait]
impl MessageHandler for Reverse {
    async fn on_message(&self, server: &Server, client: &ConnectedClient, message: Message) -> Result<()> {
        let mut payload = message.payload().unwrap_or_default().to_vec();
        payload.reverse();
        server
            .send_kind_to(client.id, message.kind().unwrap_or(PayloadKind::Text), payload, message.id())
            .await
    }
}

struct Silent;

#[async_trait::async_trait]
impl MessageHandler for Silent {
    async fn on_message(&self, _server: &Server, _client: &ConnectedClient, _message: Message) -> Result<()> {
        Ok(())
    }
}

async fn server_with(handler: Arc<dyn MessageHandler>) -> Server {
    let server = Server::bind(ServerConfig::new("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    server.spawn_handler(handler).await;
    server.start().await.unwrap();
    server
}

fn config(chunk_size: u16) -> ClientConfig {
    ClientConfig::default()
        .with_chunk_size(chunk_size)
        .with_local_bind(LocalBind::Ephemeral)
}

#[tokio::test]
async fn test_send_returns_correlated_reply() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Client::connect(server.local_addr(), config(1024)).await.unwrap();
    assert_eq!(client.chunk_size(), 1024);
    assert_eq!(client.peer_addr(), server.local_addr());

    let reply = client.send("abc").await.unwrap();
    assert_eq!(reply.payload().unwrap().as_ref(), b"cba");
    assert_eq!(reply.kind(), Some(PayloadKind::Text));
    assert_eq!(client.pending_count().await, 0);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_send_kind_is_preserved() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Client::connect(server.local_addr(), config(64)).await.unwrap();

    let reply = client.send_kind(PayloadKind::Markup, "<a/>").await.unwrap();
    assert_eq!(reply.kind(), Some(PayloadKind::Markup));
    assert_eq!(reply.payload().unwrap().as_ref(), b">/a<");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_multi_chunk_round_trip() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Client::connect(server.local_addr(), config(16)).await.unwrap();

    let payload: Vec<u8> = (0..100u8).collect();
    let reply = client.send(payload.clone()).await.unwrap();
    assert_eq!(reply.len(), 10);
    let mut expected = payload;
    expected.reverse();
    assert_eq!(reply.payload().unwrap().to_vec(), expected);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_sends_on_one_connection() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Arc::new(Client::connect(server.local_addr(), config(16)).await.unwrap());

    let mut tasks = Vec::new();
    for n in 0..16u8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let payload = vec![n; 40];
            let reply = client.send(payload.clone()).await.unwrap();
            assert_eq!(reply.payload().unwrap().to_vec(), payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(client.pending_count().await, 0);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_single_chunk_sends() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Arc::new(Client::connect(server.local_addr(), config(1024)).await.unwrap());

    let mut tasks = Vec::new();
    for n in 0..64u8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.send_with_timeout(vec![n, n + 1], Duration::from_secs(3)).await
        }));
    }
    for (n, task) in (0..64u8).zip(tasks) {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.payload().unwrap().as_ref(), &[n + 1, n][..]);
    }
    assert_eq!(client.pending_count().await, 0);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_send_with_timeout_releases_slot() {
    let server = server_with(Arc::new(Silent)).await;
    let client = Client::connect(server.local_addr(), config(1024)).await.unwrap();

    let result = client.send_with_timeout("hello?", Duration::from_millis(100)).await;
    assert!(matches!(result, Err(NmepError::Timeout { .. })));
    assert_eq!(client.pending_count().await, 0);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_connect_rejects_small_chunk_size() {
    let result = Client::connect("127.0.0.1:1".parse().unwrap(), config(6)).await;
    assert!(matches!(
        result,
        Err(NmepError::Protocol(ProtocolError::ChunkSizeTooSmall { size: 6, .. }))
    ));
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Client::connect(addr, config(1024)).await;
    assert!(matches!(result, Err(NmepError::Io(_))));
}

#[tokio::test]
async fn test_close_and_send_after_close() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Client::connect(server.local_addr(), config(1024)).await.unwrap();

    client.close().await;
    assert_eq!(client.state(), EndpointState::Closed);

    let result = client.send("too late").await;
    assert!(matches!(result, Err(NmepError::ConnectionClosed)));
    assert_eq!(client.pending_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_server_close_ends_receive_loop() {
    let server = server_with(Arc::new(Reverse)).await;
    let client = Client::connect(server.local_addr(), config(1024)).await.unwrap();
    let mut state = client.endpoint.subscribe_state();

    client.send("warm up").await.unwrap();
    server.stop().await;

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == EndpointState::Closed))
        .await
        .unwrap()
        .unwrap();
    client.close().await;
}
