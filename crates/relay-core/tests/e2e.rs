//! End-to-end tests for relay-core.
//!
//! Exercises peers, the registry and discovery together over real sockets on
//! the loopback interface.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relay_core::{
    Connection, Discovery, DiscoveryConfig, LogLevel, Logger, PeerEndpoint, PeerRegistry,
    RelayError, SocketMode, RELAY_MARKER,
};

// ============================================================================
// Helpers
// ============================================================================

fn test_logger() -> Logger {
    Logger::with_level(LogLevel::Warning)
}

/// Listening endpoint on an ephemeral loopback port.
fn start_hub(log: &Logger) -> (PeerEndpoint, u16) {
    let hub = PeerEndpoint::listen("hub", "127.0.0.1", 0, 5, log).expect("Failed to start hub");
    let port = hub
        .connection()
        .local_addr()
        .expect("Hub has no local address")
        .port();
    (hub, port)
}

/// Plain TCP sink standing in for a remote peer.
struct Sink {
    listener: TcpListener,
    port: u16,
}

impl Sink {
    fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind sink");
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    fn connect_peer(&self, id: &str, log: &Logger) -> (Arc<PeerEndpoint>, TcpStream) {
        let peer = PeerEndpoint::connect(id, "127.0.0.1", self.port, log)
            .expect("Failed to connect peer");
        let (stream, _) = self.listener.accept().expect("Sink failed to accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (Arc::new(peer), stream)
    }
}

fn read_text(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).expect("Sink read failed");
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

// ============================================================================
// Point-to-point
// ============================================================================

#[test]
fn test_ping_through_accepted_client() {
    let log = test_logger();
    let (hub, port) = start_hub(&log);
    let client = PeerEndpoint::connect("client", "127.0.0.1", port, &log).unwrap();

    assert_eq!(hub.accept_clients(1).unwrap(), 1);
    assert!(client.send_message("ping").unwrap() > 0);

    let received = hub.receive_message().unwrap();
    assert_eq!(received.as_deref(), Some("ping"));
    assert_eq!(hub.stats().messages_received, 1);
    assert_eq!(client.stats().bytes_sent, 4);
}

#[test]
fn test_client_sees_hub_shutdown() {
    let log = test_logger();
    let (hub, port) = start_hub(&log);
    let client = PeerEndpoint::connect("client", "127.0.0.1", port, &log).unwrap();
    hub.accept_clients(1).unwrap();

    hub.close_connection();
    assert!(client.receive_message().unwrap().is_none());
    assert!(!client.is_connected());
    assert!(matches!(client.send_message("late"), Err(RelayError::Closed)));
}

#[test]
fn test_accept_on_client_is_rejected() {
    let log = test_logger();
    let (_hub, port) = start_hub(&log);
    let client = PeerEndpoint::connect("client", "127.0.0.1", port, &log).unwrap();

    let err = client.accept_clients(1).unwrap_err();
    assert!(err.is_setup());
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_relay_reaches_hub_with_marker() {
    let log = test_logger();
    let (hub, port) = start_hub(&log);
    let registry = PeerRegistry::new(&log);

    // "b" connects first so it is the hub's first child.
    let b = Arc::new(PeerEndpoint::connect("b", "127.0.0.1", port, &log).unwrap());
    hub.accept_clients(1).unwrap();
    let a = Arc::new(PeerEndpoint::connect("a", "127.0.0.1", port, &log).unwrap());
    hub.accept_clients(1).unwrap();
    assert_eq!(hub.client_count(), 2);

    registry.add_peer(a.clone()).unwrap();
    registry.add_peer(b.clone()).unwrap();

    let before = a.last_active();
    thread::sleep(Duration::from_millis(5));
    registry.relay_message("a", "b", "hi").unwrap();

    let received = hub.receive_message().unwrap();
    assert_eq!(received, Some(format!("{}hi", RELAY_MARKER)));
    assert_eq!(received.as_deref(), Some("[Relayed] hi"));
    assert!(a.last_active() > before);
    assert_eq!(b.stats().messages_sent, 1);
}

#[test]
fn test_relay_between_unknown_peers_changes_nothing() {
    let log = test_logger();
    let sink = Sink::bind();
    let registry = PeerRegistry::new(&log);
    let (a, _stream) = sink.connect_peer("a", &log);
    registry.add_peer(a.clone()).unwrap();
    let before = a.last_active();
    thread::sleep(Duration::from_millis(5));

    assert!(matches!(
        registry.relay_message("a", "nobody", "hi"),
        Err(RelayError::PeerNotFound(_))
    ));
    assert!(matches!(
        registry.relay_message("nobody", "a", "hi"),
        Err(RelayError::PeerNotFound(_))
    ));
    assert_eq!(registry.len(), 1);
    assert_eq!(a.stats().messages_sent, 0);
    assert_eq!(a.last_active(), before);
}

#[test]
fn test_broadcast_skips_failed_peer() {
    let log = test_logger();
    let sink = Sink::bind();
    let registry = PeerRegistry::new(&log);

    let (alpha, mut alpha_stream) = sink.connect_peer("alpha", &log);
    let (gamma, mut gamma_stream) = sink.connect_peer("gamma", &log);
    let never_connected = Connection::new(SocketMode::StreamClient, &log).unwrap();
    let beta = Arc::new(PeerEndpoint::new("beta", "127.0.0.1", 1, never_connected, &log).unwrap());

    registry.add_peer(alpha).unwrap();
    registry.add_peer(beta).unwrap();
    registry.add_peer(gamma).unwrap();

    let report = registry.broadcast("hello all");
    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, vec!["beta".to_string()]);

    assert_eq!(read_text(&mut alpha_stream), "hello all");
    assert_eq!(read_text(&mut gamma_stream), "hello all");
}

#[test]
fn test_inactive_peers_are_pruned() {
    let log = test_logger();
    let sink = Sink::bind();
    let registry = PeerRegistry::new(&log);
    let (quiet, _s1) = sink.connect_peer("quiet", &log);
    let (chatty, _s2) = sink.connect_peer("chatty", &log);
    registry.add_peer(quiet).unwrap();
    registry.add_peer(chatty.clone()).unwrap();

    let later = std::time::SystemTime::now() + Duration::from_secs(120);
    chatty.touch_at(later);

    let removed = registry.remove_inactive_peers_at(later, Duration::from_secs(60));
    assert_eq!(removed, vec!["quiet".to_string()]);
    assert_eq!(registry.list_peers().len(), 1);
}

// ============================================================================
// Discovery (multicast)
// ============================================================================

#[test]
#[ignore = "requires a multicast-capable network interface"]
fn test_two_nodes_discover_each_other() {
    let log = test_logger();
    let config = DiscoveryConfig {
        port: 45353,
        probe_interval_ms: 200,
        receive_timeout_ms: 200,
        ..Default::default()
    };

    let first = Discovery::new(config.clone(), &log).expect("Failed to create first node");
    let second = Discovery::new(config, &log).expect("Failed to create second node");
    first.start().unwrap();
    second.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline
        && (first.discovered_peers().is_empty() || second.discovered_peers().is_empty())
    {
        thread::sleep(Duration::from_millis(50));
    }

    let found_by_first = first.discovered_peers();
    let found_by_second = second.discovered_peers();
    assert!(!found_by_first.is_empty());
    assert!(!found_by_second.is_empty());
    for addr in found_by_first.iter().chain(&found_by_second) {
        assert!(addr.ends_with(":45353"), "unexpected address {}", addr);
    }
    // Both nodes share the host's address and the discovery port, so each
    // must have recorded an address the other answers on.
    assert!(
        found_by_first.iter().any(|addr| found_by_second.contains(addr)),
        "nodes saw disjoint peers: {:?} vs {:?}",
        found_by_first,
        found_by_second
    );

    first.stop();
    second.stop();
    assert!(!first.is_running());
}
