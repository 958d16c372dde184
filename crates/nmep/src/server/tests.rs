//! Unit tests for the accepting side, driven by raw TCP peers

use super::*;
use nmep_proto::{Chunk, ChunkCodec};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

async fn started_server() -> Server {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_handshake_timeout(Duration::from_millis(200));
    let server = Server::bind(config).await.unwrap();
    server.start().await.unwrap();
    server
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("event channel closed")
}

async fn raw_connect(server: &Server, chunk_size: u16) -> TcpStream {
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream.write_all(&Handshake::new(chunk_size).encode()).await.unwrap();
    stream
}

async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let server = started_server().await;
    assert!(matches!(server.start().await, Err(NmepError::Configuration(_))));
    server.stop().await;
}

#[tokio::test]
async fn test_connected_event_carries_chunk_size() {
    let server = started_server().await;
    let mut events = server.subscribe().await;

    let _stream = raw_connect(&server, 512).await;
    match next_event(&mut events).await {
        ServerEvent::Connected(client) => {
            assert_eq!(client.id, ConnectionId(1));
            assert_eq!(client.chunk_size, 512);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(server.connection_count().await, 1);
    assert_eq!(server.connections().await, vec![ConnectionId(1)]);

    server.stop().await;
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn test_bad_handshake_is_closed_without_event() {
    let server = started_server().await;
    let mut events = server.subscribe().await;

    let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
    bad.write_all(&[0xEB, 0x01, 0x00, 0x04]).await.unwrap();
    expect_closed(&mut bad).await;

    let mut old_version = TcpStream::connect(server.local_addr()).await.unwrap();
    old_version.write_all(&[0xEA, 0x02, 0x00, 0x04]).await.unwrap();
    expect_closed(&mut old_version).await;

    // The accept loop keeps going and ids are only spent on accepted clients
    let _good = raw_connect(&server, 1024).await;
    match next_event(&mut events).await {
        ServerEvent::Connected(client) => assert_eq!(client.id, ConnectionId(1)),
        other => panic!("unexpected event: {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let server = started_server().await;
    let mut silent = TcpStream::connect(server.local_addr()).await.unwrap();
    expect_closed(&mut silent).await;
    assert_eq!(server.connection_count().await, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_message_received_and_reply() {
    let server = started_server().await;
    let mut events = server.subscribe().await;
    let mut stream = raw_connect(&server, 16).await;

    let client = match next_event(&mut events).await {
        ServerEvent::Connected(client) => client,
        other => panic!("unexpected event: {:?}", other),
    };

    // 20 bytes at 10 per chunk: two full-size frames
    let request = Message::outgoing(vec![7u8; 20], PayloadKind::Text, 16, 900).unwrap();
    for chunk in request.chunks() {
        stream.write_all(&chunk.encode()).await.unwrap();
    }

    match next_event(&mut events).await {
        ServerEvent::MessageReceived { client: from, message } => {
            assert_eq!(from.id, client.id);
            assert_eq!(message.id(), 900);
            assert_eq!(message.payload().unwrap().as_ref(), &[7u8; 20][..]);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    server.send_to(client.id, vec![1u8; 30], 900).await.unwrap();

    let mut codec = ChunkCodec::new(16);
    let mut reply = Message::incoming(900);
    while !reply.is_complete() {
        let frame = timeout(Duration::from_secs(5), codec.read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(reply.add(Chunk::decode(&frame).unwrap()));
    }
    assert_eq!(reply.len(), 3);
    assert_eq!(reply.payload().unwrap().as_ref(), &[1u8; 30][..]);

    server.stop().await;
}

#[tokio::test]
async fn test_send_to_unknown_connection() {
    let server = started_server().await;
    let result = server.send_to(ConnectionId(42), "nobody", 1).await;
    assert!(matches!(result, Err(NmepError::UnknownConnection(42))));
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let server = started_server().await;
    let mut events = server.subscribe().await;
    let stream = raw_connect(&server, 64).await;

    let client = match next_event(&mut events).await {
        ServerEvent::Connected(client) => client,
        other => panic!("unexpected event: {:?}", other),
    };

    drop(stream);
    match next_event(&mut events).await {
        ServerEvent::Disconnected(gone) => assert_eq!(gone, client),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(server.connection_count().await, 0);
    assert!(matches!(
        server.send_to(client.id, "late", 1).await,
        Err(NmepError::UnknownConnection(_))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_connections() {
    let server = started_server().await;
    let mut events = server.subscribe().await;
    let mut stream = raw_connect(&server, 64).await;
    assert!(matches!(next_event(&mut events).await, ServerEvent::Connected(_)));

    server.stop().await;
    expect_closed(&mut stream).await;
    assert_eq!(server.connection_count().await, 0);
}

struct Echo;

#[async_trait::async_trait]
impl MessageHandler for Echo {
    async fn on_message(&self, server: &Server, client: &ConnectedClient, message: Message) -> Result<()> {
        let payload = message.payload().unwrap_or_default();
        server.send_to(client.id, payload, message.id()).await
    }
}

#[tokio::test]
async fn test_spawn_handler_replies() {
    let server = started_server().await;
    let handler = server.spawn_handler(Arc::new(Echo)).await;
    let mut stream = raw_connect(&server, 32).await;

    let request = Message::outgoing("ping", PayloadKind::Text, 32, 5).unwrap();
    stream.write_all(&request.chunks()[0].encode()).await.unwrap();

    let mut codec = ChunkCodec::new(32);
    let frame = timeout(Duration::from_secs(5), codec.read_frame(&mut stream))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let chunk = Chunk::decode(&frame).unwrap();
    assert_eq!(chunk.message_id(), 5);
    assert_eq!(chunk.data().as_ref(), b"ping");
    assert!(chunk.is_final());

    handler.abort();
    server.stop().await;
}
