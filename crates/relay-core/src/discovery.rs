//! UDP multicast peer discovery.
//!
//! A running `Discovery` owns two worker threads sharing one datagram
//! connection:
//!
//! - **prober**: sends `DISCOVERY_REQUEST` to the multicast group every probe
//!   interval. The wait is a channel `recv_timeout`, so `stop()` wakes it
//!   immediately.
//! - **listener**: answers requests with a direct `DISCOVERY_RESPONSE` and
//!   records the `ip:port` of every responder, once.
//!
//! Both workers start together or not at all. `stop()` closes the socket, so
//! a listener blocked in receive returns right away; otherwise it notices the
//! stop flag within one receive timeout.

use crate::connection::{Connection, SocketMode};
use crate::error::{RelayError, Result};
use crate::logging::Logger;
use crate::message::{DiscoveryMessage, MAX_DATAGRAM_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Multicast group (default: 239.255.0.1)
    #[serde(default = "default_group")]
    pub group: String,

    /// Port shared by every node for discovery traffic (default: 5353)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local address the discovery socket binds to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Time between probes in milliseconds (default: 5000)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Listener read timeout in milliseconds (default: 1000)
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
}

impl DiscoveryConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            bind_address: default_bind_address(),
            probe_interval_ms: default_probe_interval(),
            receive_timeout_ms: default_receive_timeout(),
        }
    }
}

fn default_group() -> String {
    "239.255.0.1".to_string()
}

fn default_port() -> u16 {
    5353
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_probe_interval() -> u64 {
    5000
}

fn default_receive_timeout() -> u64 {
    1000
}

type PeerHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// State shared with the worker threads.
struct Shared {
    connection: Connection,
    /// Where probes are sent
    target: SocketAddr,
    probe_interval: Duration,
    /// Discovered addresses in discovery order, no duplicates
    discovered: Mutex<Vec<String>>,
    stop: AtomicBool,
    on_discovered: RwLock<Option<PeerHandler>>,
    log: Logger,
}

struct Workers {
    prober: JoinHandle<()>,
    listener: JoinHandle<()>,
    wake: Sender<()>,
}

pub struct Discovery {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl Discovery {
    /// Bind `bind_address:port` and join the multicast group.
    pub fn new(config: DiscoveryConfig, log: &Logger) -> Result<Self> {
        let group: IpAddr = config.group.parse().map_err(|_| {
            let err = RelayError::Configuration(format!("Invalid multicast address: {}", config.group));
            log.error(&err);
            err
        })?;
        if config.receive_timeout_ms == 0 || config.probe_interval_ms == 0 {
            let err = RelayError::Configuration(
                "Discovery probe interval and receive timeout must be non-zero".to_string(),
            );
            log.error(&err);
            return Err(err);
        }

        let connection = Connection::new(SocketMode::Datagram, log)?;
        let use_ipv6 = config.bind_address.contains(':');
        connection.initialize(&config.bind_address, config.port, use_ipv6)?;
        connection.enable_multicast(&config.group)?;

        Self::with_connection(connection, SocketAddr::new(group, config.port), &config, log)
    }

    /// Run discovery over an already-bound datagram connection, probing
    /// `target`.
    pub(crate) fn with_connection(
        connection: Connection,
        target: SocketAddr,
        config: &DiscoveryConfig,
        log: &Logger,
    ) -> Result<Self> {
        connection.set_timeout(Some(config.receive_timeout()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                connection,
                target,
                probe_interval: config.probe_interval(),
                discovered: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                on_discovered: RwLock::new(None),
                log: log.clone(),
            }),
            workers: Mutex::new(None),
        })
    }

    /// Launch the prober and listener. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_some() {
            self.shared.log.warn("Peer discovery is already running");
            return Ok(());
        }
        if !self.shared.connection.is_open() {
            self.shared
                .log
                .warn("Cannot start peer discovery: socket is closed");
            return Err(RelayError::Closed);
        }

        self.shared.stop.store(false, Ordering::Release);
        let (wake, wake_rx) = mpsc::channel();

        let shared = self.shared.clone();
        let prober = thread::Builder::new()
            .name("discovery-prober".to_string())
            .spawn(move || shared.run_prober(wake_rx))
            .map_err(|e| self.spawn_failed(e))?;

        let shared = self.shared.clone();
        let listener = match thread::Builder::new()
            .name("discovery-listener".to_string())
            .spawn(move || shared.run_listener())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.stop.store(true, Ordering::Release);
                drop(wake);
                let _ = prober.join();
                return Err(self.spawn_failed(e));
            }
        };

        *workers = Some(Workers {
            prober,
            listener,
            wake,
        });
        self.shared
            .log
            .info(format_args!("Started peer discovery on {}", self.shared.target));
        Ok(())
    }

    /// Stop both workers and close the socket. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        self.shared.stop.store(true, Ordering::Release);
        let was_open = self.shared.connection.is_open();
        self.shared.connection.close();

        if let Some(Workers {
            prober,
            listener,
            wake,
        }) = workers.take()
        {
            let _ = wake.send(());
            drop(wake);
            if prober.join().is_err() {
                self.shared.log.error("Discovery prober panicked");
            }
            if listener.join().is_err() {
                self.shared.log.error("Discovery listener panicked");
            }
        }

        if was_open {
            self.shared.log.info("Peer discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Snapshot of discovered `ip:port` addresses, in discovery order.
    pub fn discovered_peers(&self) -> Vec<String> {
        self.shared
            .discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.connection.local_addr()
    }

    /// Invoked for every socket failure, after it is logged.
    pub fn set_error_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.shared
            .connection
            .set_shared_error_handler(Arc::new(handler));
    }

    /// Invoked once per newly discovered address, from the listener thread.
    pub fn on_peer_discovered(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        *self
            .shared
            .on_discovered
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    fn spawn_failed(&self, e: std::io::Error) -> RelayError {
        let err = RelayError::connection("Failed to spawn discovery worker", e);
        self.shared.log.error(&err);
        err
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run_prober(&self, wake: Receiver<()>) {
        let request = DiscoveryMessage::Request;
        while !self.stopped() {
            match self.connection.send_to(request.to_binary(), self.target) {
                Ok(0) => {}
                Ok(sent) => self.log.debug(format_args!(
                    "Broadcasted discovery packet: {} ({} bytes)",
                    request, sent
                )),
                Err(RelayError::Closed) => break,
                Err(e) => self
                    .log
                    .error(format_args!("Failed to broadcast discovery packet: {}", e)),
            }

            match wake.recv_timeout(self.probe_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn run_listener(&self) {
        while !self.stopped() {
            let (data, sender) = match self.connection.receive_from(MAX_DATAGRAM_SIZE) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(RelayError::Closed) => break,
                Err(e) => {
                    self.log
                        .error(format_args!("Error receiving discovery message: {}", e));
                    continue;
                }
            };

            match DiscoveryMessage::from_binary(&data) {
                Some(DiscoveryMessage::Request) => self.respond(sender),
                Some(DiscoveryMessage::Response) => self.record(sender),
                None => self.log.debug(format_args!(
                    "Ignoring unrecognized datagram ({} bytes) from {}",
                    data.len(),
                    sender
                )),
            }
        }
    }

    fn respond(&self, sender: SocketAddr) {
        let response = DiscoveryMessage::Response;
        match self.connection.send_to(response.to_binary(), sender) {
            Ok(0) => {}
            Ok(sent) => self.log.debug(format_args!(
                "Sent discovery response ({} bytes) to {}",
                sent, sender
            )),
            Err(e) => self
                .log
                .error(format_args!("Failed to send discovery response: {}", e)),
        }
    }

    fn record(&self, sender: SocketAddr) {
        let address = sender.to_string();
        self.log.debug(format_args!(
            "Received discovery response from {}",
            address
        ));

        {
            let mut discovered = self.discovered.lock().unwrap_or_else(|e| e.into_inner());
            if discovered.contains(&address) {
                return;
            }
            discovered.push(address.clone());
        }
        self.log.info(format_args!("Added new peer: {}", address));

        let handler = self
            .on_discovered
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use std::net::UdpSocket;
    use std::time::Instant;

    fn quiet() -> Logger {
        Logger::with_level(LogLevel::Critical)
    }

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            probe_interval_ms: 100,
            receive_timeout_ms: 100,
            ..Default::default()
        }
    }

    /// Loopback unicast stand-in for the multicast group: probes go to `sink`.
    fn loopback(log: &Logger) -> (Discovery, UdpSocket) {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let conn = Connection::new(SocketMode::Datagram, log).unwrap();
        conn.initialize("127.0.0.1", 0, false).unwrap();
        let discovery =
            Discovery::with_connection(conn, sink.local_addr().unwrap(), &fast_config(), log)
                .unwrap();
        (discovery, sink)
    }

    fn probe_socket() -> UdpSocket {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        probe
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: DiscoveryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.group, "239.255.0.1");
        assert_eq!(config.port, 5353);
        assert_eq!(config.probe_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_group_is_configuration_error() {
        let config = DiscoveryConfig {
            group: "not-a-group".into(),
            ..Default::default()
        };
        let err = Discovery::new(config, &quiet()).err().unwrap();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn test_prober_sends_requests() {
        let log = quiet();
        let (discovery, sink) = loopback(&log);
        discovery.start().unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = sink.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"DISCOVERY_REQUEST");
        assert_eq!(Some(from), discovery.local_addr());

        discovery.stop();
    }

    #[test]
    fn test_listener_answers_requests() {
        let log = quiet();
        let (discovery, _sink) = loopback(&log);
        let target = discovery.local_addr().unwrap();
        discovery.start().unwrap();

        let probe = probe_socket();
        probe.send_to(b"DISCOVERY_REQUEST", target).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = probe.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"DISCOVERY_RESPONSE");
        assert_eq!(from, target);
    }

    #[test]
    fn test_responses_are_recorded_once() {
        let log = quiet();
        let (discovery, _sink) = loopback(&log);
        let target = discovery.local_addr().unwrap();

        let notified = Arc::new(Mutex::new(Vec::new()));
        let seen = notified.clone();
        discovery.on_peer_discovered(move |addr| seen.lock().unwrap().push(addr.to_string()));
        discovery.start().unwrap();

        let probe = probe_socket();
        let expected = probe.local_addr().unwrap().to_string();
        probe.send_to(b"DISCOVERY_RESPONSE", target).unwrap();
        probe.send_to(b"DISCOVERY_RESPONSE", target).unwrap();
        probe.send_to(b"HELLO", target).unwrap();

        assert!(wait_for(|| !discovery.discovered_peers().is_empty()));
        // Let the duplicate and the junk datagram drain through the listener.
        thread::sleep(Duration::from_millis(200));

        assert_eq!(discovery.discovered_peers(), vec![expected.clone()]);
        assert_eq!(*notified.lock().unwrap(), vec![expected]);
    }

    #[test]
    fn test_start_is_idempotent_and_stop_is_final() {
        let log = quiet();
        let (discovery, _sink) = loopback(&log);

        discovery.start().unwrap();
        discovery.start().unwrap();
        assert!(discovery.is_running());

        discovery.stop();
        discovery.stop();
        assert!(!discovery.is_running());
        assert!(discovery.local_addr().is_none());
        assert!(matches!(discovery.start(), Err(RelayError::Closed)));
    }

    #[test]
    fn test_stop_without_start() {
        let log = quiet();
        let (discovery, _sink) = loopback(&log);
        discovery.stop();
        assert!(!discovery.is_running());
    }

    #[test]
    fn test_stop_returns_promptly() {
        let log = quiet();
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let conn = Connection::new(SocketMode::Datagram, &log).unwrap();
        conn.initialize("127.0.0.1", 0, false).unwrap();
        let config = DiscoveryConfig {
            probe_interval_ms: 60_000,
            receive_timeout_ms: 500,
            ..Default::default()
        };
        let discovery =
            Discovery::with_connection(conn, sink.local_addr().unwrap(), &config, &log).unwrap();
        discovery.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        discovery.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
