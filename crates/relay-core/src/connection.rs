//! Socket connections.
//!
//! A `Connection` owns one OS socket in one of three modes: a stream server
//! that binds, listens and accepts; a stream client that connects; or a
//! datagram socket that binds and optionally joins a multicast group.
//!
//! Setup calls (`initialize`, `enable_multicast`, `listen`, option setters)
//! return errors to the caller. Steady-state I/O never does: a failed send
//! reports `Ok(0)` and a failed or timed-out receive reports an empty payload.
//! Every failure is logged, then handed to the optional error handler.
//!
//! I/O runs on a cloned handle so no lock is held while a call blocks, and
//! `close()` from another thread shuts the socket down, releasing a pending
//! receive or accept.

use crate::error::{RelayError, Result};
use crate::logging::Logger;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Callback invoked with the message of every failure a connection reports.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketMode {
    /// Binds, listens and accepts stream clients
    StreamServer,
    /// Connects to a stream server (also the mode of accepted children)
    StreamClient,
    /// Connectionless datagrams, optionally multicast
    Datagram,
}

impl Display for SocketMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketMode::StreamServer => "STREAM_SERVER",
            SocketMode::StreamClient => "STREAM_CLIENT",
            SocketMode::Datagram => "DATAGRAM",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    fn domain(&self) -> Domain {
        match self {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        }
    }

    fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv6() {
            AddressFamily::Ipv6
        } else {
            AddressFamily::Ipv4
        }
    }
}

/// The OS resource behind an open connection.
///
/// Sockets start out `Pending` and are converted to the matching std type
/// once setup has put them into a usable state.
#[derive(Clone)]
enum Handle {
    /// Allocated but not yet connected, or a bound server before `listen()`
    Pending(Arc<Socket>),
    Listener(Arc<TcpListener>),
    Stream(Arc<TcpStream>),
    Datagram(Arc<UdpSocket>),
}

impl Handle {
    fn sock(&self) -> SockRef<'_> {
        match self {
            Handle::Pending(s) => SockRef::from(&**s),
            Handle::Listener(l) => SockRef::from(&**l),
            Handle::Stream(s) => SockRef::from(&**s),
            Handle::Datagram(u) => SockRef::from(&**u),
        }
    }
}

struct State {
    handle: Option<Handle>,
    family: AddressFamily,
}

pub struct Connection {
    mode: SocketMode,
    state: RwLock<State>,
    /// Mirrors `state.handle.is_some()` for lock-free `is_open()`
    open: AtomicBool,
    error_handler: RwLock<Option<ErrorHandler>>,
    log: Logger,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("mode", &self.mode)
            .field("open", &self.is_open())
            .finish()
    }
}

fn new_socket(mode: SocketMode, family: AddressFamily) -> io::Result<Socket> {
    let (ty, protocol) = match mode {
        SocketMode::Datagram => (Type::DGRAM, Protocol::UDP),
        SocketMode::StreamServer | SocketMode::StreamClient => (Type::STREAM, Protocol::TCP),
    };
    Socket::new(family.domain(), ty, Some(protocol))
}

/// Take ownership of a pending socket, duplicating it if a concurrent call
/// still holds a reference.
fn into_owned(socket: Arc<Socket>) -> io::Result<Socket> {
    Arc::try_unwrap(socket).or_else(|shared| shared.try_clone())
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

impl Connection {
    /// Allocate a socket for `mode` (IPv4 until `initialize` asks for IPv6).
    pub fn new(mode: SocketMode, log: &Logger) -> Result<Self> {
        let socket = new_socket(mode, AddressFamily::Ipv4).map_err(|e| {
            let err = RelayError::connection("Failed to create socket", e);
            log.error(&err);
            err
        })?;

        log.info(format_args!("Connection created. Mode: {}", mode));
        Ok(Self {
            mode,
            state: RwLock::new(State {
                handle: Some(Handle::Pending(Arc::new(socket))),
                family: AddressFamily::Ipv4,
            }),
            open: AtomicBool::new(true),
            error_handler: RwLock::new(None),
            log: log.clone(),
        })
    }

    /// Wrap a stream produced by `accept()`.
    fn from_accepted(stream: TcpStream, family: AddressFamily, log: &Logger) -> Self {
        Self {
            mode: SocketMode::StreamClient,
            state: RwLock::new(State {
                handle: Some(Handle::Stream(Arc::new(stream))),
                family,
            }),
            open: AtomicBool::new(true),
            error_handler: RwLock::new(None),
            log: log.clone(),
        }
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn family(&self) -> AddressFamily {
        self.state.read().unwrap_or_else(|e| e.into_inner()).family
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn set_error_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.set_shared_error_handler(Arc::new(handler));
    }

    pub(crate) fn set_shared_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Bind (stream server, datagram) or connect (stream client).
    pub fn initialize(&self, address: &str, port: u16, use_ipv6: bool) -> Result<()> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| self.fail(RelayError::Configuration(format!("Invalid IP address: {}", address))))?;

        if ip.is_ipv6() != use_ipv6 {
            return Err(self.fail(RelayError::Configuration(format!(
                "Address {} does not match the requested {} family",
                address,
                if use_ipv6 { "IPv6" } else { "IPv4" }
            ))));
        }
        if self.mode == SocketMode::StreamClient && port == 0 {
            return Err(self.fail(RelayError::Configuration(
                "Port 0 is not a valid connect target".to_string(),
            )));
        }

        let target = SocketAddr::new(ip, port);
        let family = AddressFamily::of(&target);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let socket = match state.handle.take() {
            Some(Handle::Pending(socket)) => socket,
            Some(other) => {
                state.handle = Some(other);
                drop(state);
                return Err(self.fail(RelayError::Configuration(
                    "Connection is already initialized".to_string(),
                )));
            }
            None => {
                self.log.warn("Cannot initialize: connection is closed");
                return Err(RelayError::Closed);
            }
        };

        let socket = if state.family != family {
            match new_socket(self.mode, family) {
                Ok(fresh) => {
                    self.log
                        .info(format_args!("Socket re-created for {:?} addressing", family));
                    state.family = family;
                    Arc::new(fresh)
                }
                Err(e) => {
                    state.handle = Some(Handle::Pending(socket));
                    drop(state);
                    return Err(self.fail(RelayError::connection("Failed to create socket", e)));
                }
            }
        } else {
            socket
        };

        if let Err(err) = self.configure(&socket, target) {
            state.handle = Some(Handle::Pending(socket));
            drop(state);
            return Err(self.fail(err));
        }

        let handle = match self.mode {
            SocketMode::StreamServer => Ok(Handle::Pending(socket)),
            SocketMode::Datagram => {
                into_owned(socket).map(|s| Handle::Datagram(Arc::new(UdpSocket::from(s))))
            }
            SocketMode::StreamClient => {
                into_owned(socket).map(|s| Handle::Stream(Arc::new(TcpStream::from(s))))
            }
        };
        match handle {
            Ok(handle) => {
                state.handle = Some(handle);
                drop(state);
                self.log
                    .info(format_args!("Connection initialized at {}", target));
                Ok(())
            }
            Err(e) => {
                self.open.store(false, Ordering::Release);
                drop(state);
                Err(self.fail(RelayError::connection("Failed to take socket ownership", e)))
            }
        }
    }

    fn configure(&self, socket: &Socket, target: SocketAddr) -> Result<()> {
        match self.mode {
            SocketMode::StreamServer | SocketMode::Datagram => {
                socket
                    .set_reuse_address(true)
                    .map_err(|e| RelayError::connection("Failed to set SO_REUSEADDR", e))?;
                #[cfg(unix)]
                if self.mode == SocketMode::Datagram {
                    socket
                        .set_reuse_port(true)
                        .map_err(|e| RelayError::connection("Failed to set SO_REUSEPORT", e))?;
                }
                socket
                    .bind(&target.into())
                    .map_err(|e| RelayError::connection(format!("Failed to bind socket to {}", target), e))
            }
            SocketMode::StreamClient => socket
                .connect(&target.into())
                .map_err(|e| RelayError::connection(format!("Failed to connect to {}", target), e)),
        }
    }

    /// Join a multicast group on any interface. Datagram mode only.
    pub fn enable_multicast(&self, group: &str) -> Result<()> {
        self.require_mode("enable_multicast", SocketMode::Datagram)?;

        let group_ip: IpAddr = group.parse().map_err(|_| {
            self.fail(RelayError::Configuration(format!("Invalid multicast address: {}", group)))
        })?;
        if !group_ip.is_multicast() {
            return Err(self.fail(RelayError::Configuration(format!(
                "{} is not a multicast address",
                group
            ))));
        }

        let handle = self.handle("enable multicast")?;
        let sock = handle.sock();
        let joined = match group_ip {
            IpAddr::V4(g) => sock
                .join_multicast_v4(&g, &Ipv4Addr::UNSPECIFIED)
                .and_then(|_| sock.set_multicast_loop_v4(true)),
            IpAddr::V6(g) => sock
                .join_multicast_v6(&g, 0)
                .and_then(|_| sock.set_multicast_loop_v6(true)),
        };
        joined.map_err(|e| {
            self.fail(RelayError::connection(
                format!("Failed to join multicast group {}", group),
                e,
            ))
        })?;

        self.log.info(format_args!("Joined multicast group {}", group));
        Ok(())
    }

    /// Start accepting connections. Stream server only.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.require_mode("listen", SocketMode::StreamServer)?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let socket = match state.handle.take() {
            Some(Handle::Pending(socket)) => socket,
            Some(listener @ Handle::Listener(_)) => {
                state.handle = Some(listener);
                self.log.warn("listen() called on a socket that is already listening");
                return Ok(());
            }
            Some(other) => {
                state.handle = Some(other);
                drop(state);
                return Err(self.fail(RelayError::Configuration(
                    "Socket is not in a listenable state".to_string(),
                )));
            }
            None => {
                self.log.warn("Cannot listen: connection is closed");
                return Err(RelayError::Closed);
            }
        };

        if let Err(e) = socket.listen(backlog) {
            state.handle = Some(Handle::Pending(socket));
            drop(state);
            return Err(self.fail(RelayError::connection("Failed to listen on socket", e)));
        }

        match into_owned(socket) {
            Ok(owned) => {
                state.handle = Some(Handle::Listener(Arc::new(TcpListener::from(owned))));
                drop(state);
                self.log
                    .info(format_args!("Listening for connections (backlog {})", backlog));
                Ok(())
            }
            Err(e) => {
                self.open.store(false, Ordering::Release);
                drop(state);
                Err(self.fail(RelayError::connection("Failed to take socket ownership", e)))
            }
        }
    }

    /// Block until a client connects and return its connection.
    /// Stream server only.
    pub fn accept(&self) -> Result<Connection> {
        self.require_mode("accept", SocketMode::StreamServer)?;
        let handle = self.handle("accept")?;

        let accepted = match &handle {
            Handle::Listener(listener) => listener.accept(),
            other => other.sock().accept().and_then(|(socket, addr)| {
                let addr = addr
                    .as_socket()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))?;
                Ok((TcpStream::from(socket), addr))
            }),
        };

        match accepted {
            Ok((stream, addr)) => {
                self.log
                    .info(format_args!("Accepted new connection from {}", addr));
                Ok(Connection::from_accepted(stream, AddressFamily::of(&addr), &self.log))
            }
            Err(e) => {
                let err = RelayError::TransientIo {
                    operation: "accept",
                    source: e,
                };
                Err(self.fail(err))
            }
        }
    }

    /// Send on a connected socket. Returns bytes written, 0 on failure.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let handle = self.handle("send")?;
        let result = match &handle {
            Handle::Stream(stream) => (&**stream).write(data),
            Handle::Datagram(udp) => udp.send(data),
            other => other.sock().send(data),
        };

        match result {
            Ok(sent) => {
                self.log.debug(format_args!("Sent {} bytes", sent));
                Ok(sent)
            }
            Err(e) => {
                self.report(&format!("Failed to send data: {}", e));
                Ok(0)
            }
        }
    }

    /// Send one datagram to `dest`. Datagram mode only.
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<usize> {
        self.require_mode("send_to", SocketMode::Datagram)?;
        let handle = self.handle("send_to")?;
        let result = match &handle {
            Handle::Datagram(udp) => udp.send_to(data, dest),
            other => other.sock().send_to(data, &dest.into()),
        };

        match result {
            Ok(sent) => {
                self.log
                    .debug(format_args!("Sent {} bytes to {}", sent, dest));
                Ok(sent)
            }
            Err(e) => {
                self.report(&format!("Failed to send data to {}: {}", dest, e));
                Ok(0)
            }
        }
    }

    /// Block until data arrives, the peer closes, or the timeout expires.
    ///
    /// An empty result means no data. A stream peer closing also closes this
    /// connection.
    pub fn receive(&self, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Err(self.fail(RelayError::InvalidInput("receive buffer size must be positive")));
        }
        let handle = self.handle("receive")?;
        let mut buf = vec![0u8; max];
        let result = match &handle {
            Handle::Stream(stream) => (&**stream).read(&mut buf),
            Handle::Datagram(udp) => udp.recv(&mut buf),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        match result {
            Ok(0) if matches!(handle, Handle::Stream(_)) => {
                if self.is_open() {
                    self.log.warn("Connection closed by peer");
                    self.close();
                }
                Ok(Vec::new())
            }
            Ok(read) => {
                buf.truncate(read);
                if read > 0 {
                    self.log.debug(format_args!("Received {} bytes", read));
                }
                Ok(buf)
            }
            Err(e) => {
                self.absorb_receive_error(e);
                Ok(Vec::new())
            }
        }
    }

    /// Receive one datagram along with its sender. Datagram mode only.
    ///
    /// Returns None on timeout or transient failure.
    pub fn receive_from(&self, max: usize) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        self.require_mode("receive_from", SocketMode::Datagram)?;
        if max == 0 {
            return Err(self.fail(RelayError::InvalidInput("receive buffer size must be positive")));
        }
        let handle = self.handle("receive_from")?;
        let Handle::Datagram(udp) = &handle else {
            self.absorb_receive_error(io::Error::from(io::ErrorKind::NotConnected));
            return Ok(None);
        };

        let mut buf = vec![0u8; max];
        match udp.recv_from(&mut buf) {
            Ok((read, sender)) => {
                buf.truncate(read);
                self.log
                    .debug(format_args!("Received {} bytes from {}", read, sender));
                Ok(Some((buf, sender)))
            }
            Err(e) => {
                self.absorb_receive_error(e);
                Ok(None)
            }
        }
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        let handle = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            self.open.store(false, Ordering::Release);
            state.handle.take()
        };

        if let Some(handle) = handle {
            // Wakes any thread blocked in receive/accept on a cloned handle.
            let _ = handle.sock().shutdown(Shutdown::Both);
            self.log.info(format_args!("Connection closed. Mode: {}", self.mode));
        }
    }

    /// Read/write timeout for subsequent blocking calls. `None` blocks forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if timeout == Some(Duration::ZERO) {
            return Err(self.fail(RelayError::Configuration(
                "Timeout must be non-zero (use None to block indefinitely)".to_string(),
            )));
        }
        let handle = self.handle("set timeout")?;
        let sock = handle.sock();
        sock.set_read_timeout(timeout)
            .and_then(|_| sock.set_write_timeout(timeout))
            .map_err(|e| self.fail(RelayError::connection("Failed to set socket timeout", e)))?;

        self.log.debug(format_args!("Socket timeout set to {:?}", timeout));
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let handle = self.handle("set non-blocking mode")?;
        handle
            .sock()
            .set_nonblocking(nonblocking)
            .map_err(|e| self.fail(RelayError::connection("Failed to set non-blocking mode", e)))?;

        self.log
            .debug(format_args!("Non-blocking mode set to {}", nonblocking));
        Ok(())
    }

    /// Shut down reading and/or writing without releasing the socket.
    pub fn shutdown(&self, read: bool, write: bool) -> Result<()> {
        let how = match (read, write) {
            (true, true) => Shutdown::Both,
            (true, false) => Shutdown::Read,
            (false, true) => Shutdown::Write,
            (false, false) => return Ok(()),
        };
        let handle = self.handle("shutdown")?;
        handle.sock().shutdown(how).map_err(|e| {
            self.fail(RelayError::TransientIo {
                operation: "shutdown",
                source: e,
            })
        })?;

        self.log.info(format_args!("Socket shut down ({:?})", how));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let handle = self.handle_quiet()?;
        handle.sock().local_addr().ok()?.as_socket()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let handle = self.handle_quiet()?;
        handle.sock().peer_addr().ok()?.as_socket()
    }

    fn handle_quiet(&self) -> Option<Handle> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .handle
            .clone()
    }

    fn handle(&self, operation: &str) -> Result<Handle> {
        self.handle_quiet().ok_or_else(|| {
            self.log
                .warn(format_args!("Cannot {}: connection is closed", operation));
            RelayError::Closed
        })
    }

    fn require_mode(&self, operation: &'static str, mode: SocketMode) -> Result<()> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(self.fail(RelayError::Mode {
                operation,
                mode: self.mode,
            }))
        }
    }

    fn absorb_receive_error(&self, err: io::Error) {
        if is_timeout(&err) {
            self.log.debug("Receive timed out");
        } else if !self.is_open() {
            self.log.debug("Receive interrupted by close");
        } else {
            self.report(&format!("Failed to receive data: {}", err));
        }
    }

    /// Log and forward a failure, then hand the error back for propagation.
    fn fail(&self, err: RelayError) -> RelayError {
        self.report(&err.to_string());
        err
    }

    fn report(&self, message: &str) {
        self.log.error(message);
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
