// TCP Adapter Tests
// Configuration plus real loopback links in both directions

use applink_transport::transport::{
    AdapterEvent, AdapterEventSink, AdapterToken, ConnectFailure, DeviceKey, SendStatus,
    TcpAdapter, TcpAdapterConfig, TransportAdapter, TransportConfig, TransportError,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

fn loopback_config() -> TcpAdapterConfig {
    TcpAdapterConfig::new()
        .with_bind_address("127.0.0.1")
        .with_bind_port(0)
        .with_connect_attempts(1)
        .with_retry_delay_ms(10)
}

fn attached(config: TcpAdapterConfig) -> (TcpAdapter, UnboundedReceiver<AdapterEvent>) {
    let adapter = TcpAdapter::new(config);
    let (sink, rx) = AdapterEventSink::channel();
    adapter.attach(sink);
    (adapter, rx)
}

async fn next_event(rx: &mut UnboundedReceiver<AdapterEvent>) -> AdapterEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for adapter event")
        .expect("event channel closed")
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_u32(payload.len() as u32).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

/// Dial a test-owned listener and return the accepted peer stream plus the adapter token
async fn open_outbound(
    adapter: &TcpAdapter,
    rx: &mut UnboundedReceiver<AdapterEvent>,
) -> (TcpStream, AdapterToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let key = DeviceKey::tcp(listener.local_addr().unwrap());

    adapter.connect(&key);
    let (peer, _) = listener.accept().await.unwrap();

    match next_event(rx).await {
        AdapterEvent::ConnectionEstablished { device_key, token } => {
            assert_eq!(device_key, key);
            (peer, token)
        }
        other => panic!("expected ConnectionEstablished, got {:?}", other),
    }
}

// ============================================================================
// TCP ADAPTER CONFIG
// ============================================================================

#[test]
fn test_tcp_config_defaults() {
    let config = TcpAdapterConfig::default();

    assert_eq!(config.bind_port, 12345);
    assert_eq!(config.bind_address, "0.0.0.0");
    assert!(config.static_peers.is_empty());
    assert!(config.validate().is_ok());
}

#[test]
fn test_tcp_config_builders() {
    let peer: SocketAddr = "10.0.0.2:5000".parse().unwrap();
    let config = TcpAdapterConfig::new()
        .with_bind_address("127.0.0.1")
        .with_bind_port(9000)
        .with_nodelay(false)
        .with_static_peer(peer)
        .with_base_config(TransportConfig::new().with_max_connections(2));

    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.bind_port, 9000);
    assert!(!config.nodelay);
    assert_eq!(config.static_peers, vec![peer]);
    assert_eq!(config.base.max_connections, 2);
}

#[test]
fn test_tcp_config_rejects_zero_attempts() {
    let config = TcpAdapterConfig::new().with_connect_attempts(0);
    assert!(matches!(config.validate(), Err(TransportError::InvalidConfig(_))));
}

// ============================================================================
// DISCOVERY
// ============================================================================

#[tokio::test]
async fn test_tcp_start_binds_listener() {
    let (adapter, _rx) = attached(loopback_config());
    assert!(adapter.local_address().is_none());

    adapter.start_discovery().await.unwrap();

    assert!(adapter.is_discovering());
    assert!(adapter.local_address().unwrap().port() > 0);

    adapter.stop_discovery().await;
    assert!(!adapter.is_discovering());
}

#[tokio::test]
async fn test_tcp_start_fails_when_port_taken() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();
    let (adapter, _rx) = attached(loopback_config().with_bind_port(port));

    let result = adapter.start_discovery().await;

    assert!(matches!(result, Err(TransportError::AdapterUnavailable(_))));
}

#[tokio::test]
async fn test_tcp_static_peers_are_discovered() {
    let peer: SocketAddr = "127.0.0.1:5999".parse().unwrap();
    let (adapter, mut rx) = attached(loopback_config().with_static_peer(peer));

    adapter.start_discovery().await.unwrap();

    match next_event(&mut rx).await {
        AdapterEvent::DeviceDiscovered(info) => assert_eq!(info.key, DeviceKey::tcp(peer)),
        other => panic!("expected DeviceDiscovered, got {:?}", other),
    }
}

// ============================================================================
// OUTBOUND LINKS
// ============================================================================

#[tokio::test]
async fn test_tcp_outbound_frames_both_ways() {
    let (adapter, mut rx) = attached(loopback_config());
    let (mut peer, token) = open_outbound(&adapter, &mut rx).await;

    adapter.send(token, 1, b"hello".to_vec());
    assert_eq!(read_frame(&mut peer).await, b"hello");
    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::SendCompleted {
            token,
            sequence: 1,
            status: SendStatus::Success,
        }
    );

    write_frame(&mut peer, b"world").await;
    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::FrameReceived {
            token,
            payload: b"world".to_vec(),
        }
    );
}

#[tokio::test]
async fn test_tcp_sends_complete_in_order() {
    let (adapter, mut rx) = attached(loopback_config());
    let (mut peer, token) = open_outbound(&adapter, &mut rx).await;

    for sequence in 1..=5 {
        adapter.send(token, sequence, vec![sequence as u8; 64]);
    }

    for sequence in 1..=5u32 {
        assert_eq!(read_frame(&mut peer).await, vec![sequence as u8; 64]);
        match next_event(&mut rx).await {
            AdapterEvent::SendCompleted { sequence: s, .. } => assert_eq!(s, sequence),
            other => panic!("expected SendCompleted, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_tcp_repeated_connect_joins_pending_dial() {
    let (adapter, mut rx) = attached(loopback_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let key = DeviceKey::tcp(listener.local_addr().unwrap());

    adapter.connect(&key);
    adapter.connect(&key);
    let (_peer, _) = listener.accept().await.unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        AdapterEvent::ConnectionEstablished { device_key, .. } if device_key == key
    ));
    assert!(tokio::time::timeout(Duration::from_millis(100), listener.accept())
        .await
        .is_err());
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_tcp_connect_refused_is_reported() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (adapter, mut rx) = attached(loopback_config());

    adapter.connect(&DeviceKey::tcp(addr));

    match next_event(&mut rx).await {
        AdapterEvent::ConnectionFailed { device_key, reason } => {
            assert_eq!(device_key, DeviceKey::tcp(addr));
            assert_eq!(reason, ConnectFailure::Rejected);
        }
        other => panic!("expected ConnectionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_connect_non_tcp_key_fails() {
    let (adapter, mut rx) = attached(loopback_config());

    adapter.connect(&DeviceKey::emulator("phone"));

    assert!(matches!(
        next_event(&mut rx).await,
        AdapterEvent::ConnectionFailed {
            reason: ConnectFailure::DeviceUnreachable,
            ..
        }
    ));
}

#[tokio::test]
async fn test_tcp_disconnect_reports_close_once() {
    let (adapter, mut rx) = attached(loopback_config());
    let (mut peer, token) = open_outbound(&adapter, &mut rx).await;

    adapter.disconnect(token);

    assert!(matches!(
        next_event(&mut rx).await,
        AdapterEvent::ConnectionClosed { token: t, .. } if t == token
    ));
    assert_eq!(adapter.connection_count(), 0);

    // Peer sees the stream end.
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_peer_hangup_closes_link() {
    let (adapter, mut rx) = attached(loopback_config());
    let (peer, token) = open_outbound(&adapter, &mut rx).await;

    drop(peer);

    assert!(matches!(
        next_event(&mut rx).await,
        AdapterEvent::ConnectionClosed { token: t, .. } if t == token
    ));
}

#[tokio::test]
async fn test_tcp_oversized_frame_closes_link() {
    let config = loopback_config().with_base_config(TransportConfig::new().with_max_frame_size(8));
    let (adapter, mut rx) = attached(config);
    let (mut peer, token) = open_outbound(&adapter, &mut rx).await;

    write_frame(&mut peer, &[0u8; 32]).await;

    assert!(matches!(
        next_event(&mut rx).await,
        AdapterEvent::ConnectionClosed { token: t, .. } if t == token
    ));
}

#[tokio::test]
async fn test_tcp_oversized_send_fails_without_touching_the_wire() {
    let config = loopback_config().with_base_config(TransportConfig::new().with_max_frame_size(4));
    let (adapter, mut rx) = attached(config);
    let (mut peer, token) = open_outbound(&adapter, &mut rx).await;

    adapter.send(token, 1, vec![0u8; 8]);
    adapter.send(token, 2, b"ok".to_vec());

    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::SendCompleted {
            token,
            sequence: 1,
            status: SendStatus::Failure,
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::SendCompleted {
            token,
            sequence: 2,
            status: SendStatus::Success,
        }
    );
    assert_eq!(read_frame(&mut peer).await, b"ok".to_vec());
}

#[tokio::test]
async fn test_tcp_send_on_unknown_token_fails() {
    let (adapter, mut rx) = attached(loopback_config());
    let token = AdapterToken::from_raw(99);

    adapter.send(token, 4, vec![1, 2, 3]);

    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::SendCompleted {
            token,
            sequence: 4,
            status: SendStatus::Failure,
        }
    );
}

// ============================================================================
// INBOUND LINKS
// ============================================================================

#[tokio::test]
async fn test_tcp_inbound_connection_is_announced() {
    let (adapter, mut rx) = attached(loopback_config());
    adapter.start_discovery().await.unwrap();
    let addr = adapter.local_address().unwrap();

    let mut phone = TcpStream::connect(addr).await.unwrap();
    let phone_key = DeviceKey::tcp(phone.local_addr().unwrap());

    match next_event(&mut rx).await {
        AdapterEvent::DeviceDiscovered(info) => assert_eq!(info.key, phone_key),
        other => panic!("expected DeviceDiscovered, got {:?}", other),
    }
    let token = match next_event(&mut rx).await {
        AdapterEvent::ConnectionEstablished { device_key, token } => {
            assert_eq!(device_key, phone_key);
            token
        }
        other => panic!("expected ConnectionEstablished, got {:?}", other),
    };

    write_frame(&mut phone, b"ping").await;
    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::FrameReceived {
            token,
            payload: b"ping".to_vec(),
        }
    );

    drop(phone);
    assert!(matches!(next_event(&mut rx).await, AdapterEvent::ConnectionClosed { .. }));
    assert_eq!(
        next_event(&mut rx).await,
        AdapterEvent::DeviceLost {
            device_key: phone_key,
        }
    );
}

#[tokio::test]
async fn test_tcp_shutdown_closes_links() {
    let (adapter, mut rx) = attached(loopback_config());
    adapter.start_discovery().await.unwrap();
    let (_peer, token) = open_outbound(&adapter, &mut rx).await;

    adapter.shutdown().await;

    assert!(matches!(
        next_event(&mut rx).await,
        AdapterEvent::ConnectionClosed { token: t, .. } if t == token
    ));
    assert!(!adapter.is_discovering());
}
