//! A single network participant.
//!
//! `PeerEndpoint` wraps one [`Connection`]. In listening mode (stream server)
//! it also owns the client connections it has accepted and receives from
//! them; otherwise it sends and receives on its own connection.
//!
//! Send and receive are serialized by an I/O mutex. Counters, metadata and
//! last-active live outside it so readers never wait on the network.

use crate::connection::{Connection, SocketMode};
use crate::error::{RelayError, Result};
use crate::logging::Logger;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Largest message read by `receive_message()`.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Receive timeout applied to client connections and accepted children.
pub const CLIENT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Traffic counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    /// Time between the most recent send and the receive that followed it
    pub latency: Option<Duration>,
}

struct IoState {
    /// Accepted children, in accept order
    clients: Vec<Connection>,
    last_sent: Option<Instant>,
}

pub struct PeerEndpoint {
    id: String,
    address: String,
    port: u16,
    connection: Connection,
    io: Mutex<IoState>,
    /// Serializes blocking accepts without holding the I/O mutex
    accepting: Mutex<()>,
    stats: Mutex<PeerStats>,
    /// Milliseconds since the Unix epoch
    last_active: AtomicU64,
    metadata: RwLock<Option<String>>,
    log: Logger,
}

impl std::fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEndpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("mode", &self.connection.mode())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn validate_id(id: String, log: &Logger) -> Result<String> {
    if id.is_empty() {
        log.error("Cannot create peer: ID must not be empty");
        return Err(RelayError::InvalidInput("peer ID must not be empty"));
    }
    Ok(id)
}

impl PeerEndpoint {
    /// Wrap an already-initialized connection.
    ///
    /// Returns an error if the peer ID is empty.
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        connection: Connection,
        log: &Logger,
    ) -> Result<Self> {
        let id = validate_id(id.into(), log)?;

        let endpoint = Self {
            id,
            address: address.into(),
            port,
            connection,
            io: Mutex::new(IoState {
                clients: Vec::new(),
                last_sent: None,
            }),
            accepting: Mutex::new(()),
            stats: Mutex::new(PeerStats::default()),
            last_active: AtomicU64::new(epoch_millis(SystemTime::now())),
            metadata: RwLock::new(None),
            log: log.clone(),
        };
        log.info(format_args!(
            "Peer created: {} ({}:{})",
            endpoint.id, endpoint.address, endpoint.port
        ));
        Ok(endpoint)
    }

    /// Bind a stream server at `address:port` and start listening.
    pub fn listen(
        id: impl Into<String>,
        address: &str,
        port: u16,
        backlog: i32,
        log: &Logger,
    ) -> Result<Self> {
        let id = validate_id(id.into(), log)?;
        let connection = Connection::new(SocketMode::StreamServer, log)?;
        connection.initialize(address, port, is_ipv6(address))?;
        connection.listen(backlog)?;
        Self::new(id, address, port, connection, log)
    }

    /// Connect a stream client to `address:port`.
    pub fn connect(id: impl Into<String>, address: &str, port: u16, log: &Logger) -> Result<Self> {
        let id = validate_id(id.into(), log)?;
        let connection = Connection::new(SocketMode::StreamClient, log)?;
        connection.initialize(address, port, is_ipv6(address))?;
        connection.set_timeout(Some(CLIENT_RECEIVE_TIMEOUT))?;
        Self::new(id, address, port, connection, log)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_listening(&self) -> bool {
        self.connection.mode() == SocketMode::StreamServer
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Send `message` on the primary connection. Returns bytes written.
    pub fn send_message(&self, message: &str) -> Result<usize> {
        if !self.connection.is_open() {
            self.log.warn(format_args!(
                "Cannot send message, connection closed for peer: {}",
                self.id
            ));
            return Err(RelayError::Closed);
        }

        let mut state = self.io.lock().unwrap_or_else(|e| e.into_inner());
        state.last_sent = Some(Instant::now());
        let sent = self.connection.send(message.as_bytes())?;
        drop(state);

        if sent == 0 {
            let err = RelayError::TransientIo {
                operation: "send_message",
                source: io::Error::new(io::ErrorKind::WriteZero, "no bytes written"),
            };
            // The connection has already logged the failure.
            self.log
                .debug(format_args!("Failed to send message to peer {}: {}", self.id, err));
            return Err(err);
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.messages_sent += 1;
            stats.bytes_sent += sent as u64;
        }
        self.touch();
        self.log
            .info(format_args!("Sent message to peer {}: {}", self.id, message));
        Ok(sent)
    }

    /// Receive one message.
    ///
    /// In listening mode the accepted children are scanned in accept order
    /// and the first non-empty payload wins. Returns None if nothing arrived.
    pub fn receive_message(&self) -> Result<Option<String>> {
        if !self.connection.is_open() {
            self.log.warn(format_args!(
                "Cannot receive message, connection closed for peer: {}",
                self.id
            ));
            return Err(RelayError::Closed);
        }

        let mut state = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let payload = if self.is_listening() {
            state.clients.retain(|client| client.is_open());
            if state.clients.is_empty() {
                self.log.warn("No clients connected to receive from");
                return Ok(None);
            }

            let mut payload = Vec::new();
            for client in &state.clients {
                payload = client.receive(MAX_MESSAGE_SIZE).unwrap_or_default();
                if !payload.is_empty() {
                    break;
                }
            }
            payload
        } else {
            self.connection.receive(MAX_MESSAGE_SIZE)?
        };

        if payload.is_empty() {
            return Ok(None);
        }

        let received_at = Instant::now();
        let last_sent = state.last_sent;
        drop(state);

        let message = String::from_utf8_lossy(&payload).into_owned();
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.messages_received += 1;
            stats.bytes_received += payload.len() as u64;
            if let Some(sent) = last_sent {
                stats.latency = Some(received_at.saturating_duration_since(sent));
            }
        }
        self.touch();
        self.log
            .info(format_args!("Received message from peer {}: {}", self.id, message));
        Ok(Some(message))
    }

    /// Accept up to `max` clients, stopping at the first failed accept.
    /// Returns how many were accepted.
    pub fn accept_clients(&self, max: usize) -> Result<usize> {
        if !self.is_listening() {
            let err = RelayError::Mode {
                operation: "accept_clients",
                mode: self.connection.mode(),
            };
            self.log.error(&err);
            return Err(err);
        }

        let _accepting = self.accepting.lock().unwrap_or_else(|e| e.into_inner());
        let mut accepted = 0;
        while accepted < max {
            let client = match self.connection.accept() {
                Ok(client) => client,
                Err(e) => {
                    self.log.warn(format_args!(
                        "Peer {} stopped accepting after {} client(s): {}",
                        self.id, accepted, e
                    ));
                    break;
                }
            };
            if let Err(e) = client.set_timeout(Some(CLIENT_RECEIVE_TIMEOUT)) {
                self.log
                    .warn(format_args!("Accepted client left without receive timeout: {}", e));
            }

            self.io
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clients
                .push(client);
            accepted += 1;
        }

        if accepted > 0 {
            self.touch();
        }
        self.log
            .info(format_args!("Peer {} accepted {} client(s)", self.id, accepted));
        Ok(accepted)
    }

    pub fn client_count(&self) -> usize {
        self.io.lock().unwrap_or_else(|e| e.into_inner()).clients.len()
    }

    /// Close the primary connection and every accepted child. Idempotent.
    pub fn close_connection(&self) {
        let was_open = self.connection.is_open();
        self.connection.close();

        let clients: Vec<Connection> = self
            .io
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clients
            .drain(..)
            .collect();
        for client in &clients {
            client.close();
        }

        if was_open {
            self.log
                .info(format_args!("Connection closed for peer: {}", self.id));
        }
    }

    /// Mark the peer active now.
    pub fn touch(&self) {
        self.touch_at(SystemTime::now());
    }

    /// Mark the peer active at `time`. Never moves last-active backwards.
    pub fn touch_at(&self, time: SystemTime) {
        self.last_active
            .fetch_max(epoch_millis(time), Ordering::AcqRel);
    }

    pub fn last_active(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_active.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PeerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metadata(&self) -> Option<String> {
        self.metadata.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_metadata(&self, metadata: Option<String>) {
        *self.metadata.write().unwrap_or_else(|e| e.into_inner()) = metadata;
    }
}

impl Drop for PeerEndpoint {
    fn drop(&mut self) {
        self.close_connection();
    }
}

fn is_ipv6(address: &str) -> bool {
    address.contains(':')
}
