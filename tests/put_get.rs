//! End-to-end put-get over localhost TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use pvaccess::network::{
    connect_handshake, ClientContext, ClientError, FlushStrategy, Framed, NetworkConfig, Server,
    ServerEvent,
};
use pvaccess::protocol::{ClientValidation, Command, Encoder, DEFAULT_MAX_PAYLOAD_SIZE};
use pvaccess::provider::MemoryProvider;
use pvaccess::pvdata::{BitSet, PvStructure, ScalarType, ScalarValue, Structure};

async fn start_server(provider: Arc<MemoryProvider>) -> (Server, SocketAddr, mpsc::Receiver<ServerEvent>) {
    let mut config = NetworkConfig::new(0);
    config.bind_address = "127.0.0.1".to_string();
    let mut server = Server::new(config, provider);
    let events = server.take_event_receiver().unwrap();
    let addr = server.start().await.unwrap();
    (server, addr, events)
}

fn provider() -> Arc<MemoryProvider> {
    let provider = MemoryProvider::new();
    let mut value = PvStructure::new(Structure::nt_scalar(ScalarType::Double));
    value.set("value", ScalarValue::Double(10.0)).unwrap();
    provider.add_record("plant:temp", value);
    provider.add_record(
        "plant:mode",
        PvStructure::new(Structure::nt_scalar(ScalarType::String)),
    );
    Arc::new(provider)
}

fn empty_request() -> PvStructure {
    PvStructure::new(Structure::builder("").build())
}

async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_put_get_updates_record() {
    let provider = provider();
    let (_server, addr, _events) = start_server(provider.clone()).await;
    let context = ClientContext::new(NetworkConfig::default());

    let channel = context.create_channel(addr, "plant:temp").await.unwrap();
    let mut op = channel.create_put_get(&empty_request()).await.unwrap();
    assert_eq!(op.get_structure().unwrap().id(), "epics:nt/NTScalar:1.0");

    let before = op.get().await.unwrap();
    assert_eq!(before.value.scalar("value"), Some(&ScalarValue::Double(10.0)));

    let mut update = op.create_put().unwrap();
    let offset = update.set("value", ScalarValue::Double(12.5)).unwrap();
    update.set("alarm.severity", ScalarValue::Int(2)).unwrap();
    let after = op
        .put_get(&update, &BitSet::from_iter([offset]))
        .await
        .unwrap();
    assert_eq!(after.value.scalar("value"), Some(&ScalarValue::Double(12.5)));
    assert_eq!(after.value.scalar("alarm.severity"), Some(&ScalarValue::Int(0)));

    let stored = provider.record("plant:temp").unwrap().snapshot().await;
    assert_eq!(stored.scalar("value"), Some(&ScalarValue::Double(12.5)));

    let put_side = op.get_put().await.unwrap();
    assert_eq!(put_side.value.scalar("value"), Some(&ScalarValue::Double(12.5)));

    op.destroy().await.unwrap();
    channel.destroy().await.unwrap();
}

#[tokio::test]
async fn test_request_selects_get_fields() {
    let (_server, addr, _events) = start_server(provider()).await;
    let context = ClientContext::new(NetworkConfig::default());
    let channel = context.create_channel(addr, "plant:temp").await.unwrap();

    let value_only = Structure::builder("")
        .structure("value", Structure::builder("").build())
        .build();
    let request = PvStructure::new(
        Structure::builder("")
            .structure("getField", value_only)
            .build(),
    );
    let mut op = channel.create_put_get(&request).await.unwrap();
    let get_structure = op.get_structure().unwrap();
    assert_eq!(get_structure.fields().len(), 1);
    assert_eq!(op.put_structure().unwrap().id(), "epics:nt/NTScalar:1.0");

    let data = op.get().await.unwrap();
    assert_eq!(data.value.scalar("value"), Some(&ScalarValue::Double(10.0)));
    assert!(data.value.get("alarm").is_none());

    channel.destroy().await.unwrap();
}

#[tokio::test]
async fn test_types_are_cached_per_connection() {
    let (_server, addr, _events) = start_server(provider()).await;
    let context = ClientContext::new(NetworkConfig::default());

    let channel = context.create_channel(addr, "plant:temp").await.unwrap();
    let first = channel.create_put_get(&empty_request()).await.unwrap();
    let second = channel.create_put_get(&empty_request()).await.unwrap();
    assert_ne!(first.ioid(), second.ioid());
    assert_eq!(first.get_structure(), second.get_structure());
    assert!(channel.transport().registry().len() >= 1);

    channel.destroy().await.unwrap();
}

#[tokio::test]
async fn test_last_request_destroys_operation() {
    let (_server, addr, _events) = start_server(provider()).await;
    let context = ClientContext::new(NetworkConfig::default());
    let channel = context.create_channel(addr, "plant:mode").await.unwrap();
    let mut op = channel.create_put_get(&empty_request()).await.unwrap();

    let mut update = op.create_put().unwrap();
    let offset = update
        .set("value", ScalarValue::String("manual".into()))
        .unwrap();
    op.set_last_request();
    let result = op.put_get(&update, &BitSet::from_iter([offset])).await.unwrap();
    assert_eq!(
        result.value.scalar("value"),
        Some(&ScalarValue::String("manual".into()))
    );
    assert!(matches!(op.get().await, Err(ClientError::Destroyed)));

    channel.destroy().await.unwrap();
}

#[tokio::test]
async fn test_buffered_client() {
    let (_server, addr, _events) = start_server(provider()).await;
    let config =
        NetworkConfig::default().with_flush_strategy(FlushStrategy::Buffered { max_bytes: 64 * 1024 });
    let context = ClientContext::new(config);

    let channel = context.create_channel(addr, "plant:temp").await.unwrap();
    let mut op = channel.create_put_get(&empty_request()).await.unwrap();
    let data = op.get().await.unwrap();
    assert_eq!(data.value.scalar("value"), Some(&ScalarValue::Double(10.0)));

    channel.destroy().await.unwrap();
}

#[tokio::test]
async fn test_server_events() {
    let (_server, addr, mut events) = start_server(provider()).await;
    assert!(matches!(next_event(&mut events).await, ServerEvent::Started { .. }));

    let context = ClientContext::new(NetworkConfig::default());
    let channel = context.create_channel(addr, "plant:temp").await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::ClientConnected { priority: 0, .. }
    ));

    channel.destroy().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::ClientDisconnected { .. }
    ));
}

#[tokio::test]
async fn test_server_stop_fails_client_operations() {
    let (mut server, addr, _events) = start_server(provider()).await;
    let context = ClientContext::new(NetworkConfig::default());
    let channel = context.create_channel(addr, "plant:temp").await.unwrap();
    let mut op = channel.create_put_get(&empty_request()).await.unwrap();

    server.stop().await.unwrap();
    for _ in 0..200 {
        if channel.transport().is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!channel.is_connected());
    assert!(op.get().await.is_err());
}

#[tokio::test]
async fn test_echo_over_raw_connection() {
    let (_server, addr, _events) = start_server(provider()).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, Encoder::client(), DEFAULT_MAX_PAYLOAD_SIZE);
    let local = ClientValidation {
        receive_buffer_size: 16 * 1024,
        registry_max_size: 64,
        priority: 3,
    };
    connect_handshake(&mut framed, &local).await.unwrap();

    let mut payload = bytes::BytesMut::new();
    payload.put_slice(b"ping");
    framed.write_message(Command::Echo, &payload).await.unwrap();
    let frame = framed.read_frame().await.unwrap();
    assert_eq!(frame.command().unwrap(), Command::Echo);
    assert!(frame.is_from_server());
    assert_eq!(&frame.payload[..], b"ping");
}
