//! C ABI for relay-core.
//!
//! Every object crosses the boundary as an opaque heap handle created by a
//! `relay_create_*` function and released by the matching `relay_destroy_*`.
//! Strings returned to the caller are owned by the caller and must be freed
//! with `relay_free_string` / `relay_free_string_array`.
//!
//! Status codes: `1` success, `0` failure. Null handles and null or non-UTF-8
//! strings are rejected before any shared state is touched.
//!
//! ```text
//! C caller                      relay-ffi                 relay-core
//! ────────                      ─────────                 ──────────
//! RelayPeer*          ──────>   Arc<PeerEndpoint>  ─────> PeerEndpoint
//! RelayPeerManager*   ──────>   PeerRegistry       ─────> (shares the Arc)
//! RelayPeerDiscovery* ──────>   Discovery
//! ```

use relay_core::{
    Discovery, DiscoveryConfig, LogConfig, LogLevel, Logger, PeerEndpoint, PeerRegistry,
};
use std::ffi::{CStr, CString, c_char, c_int};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Backlog used for listening peers.
const LISTEN_BACKLOG: i32 = 5;

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(&LogConfig::default()).unwrap_or_default())
}

/// Opaque peer handle. The registry may hold another reference to the same
/// endpoint, so destroying the handle never leaves the registry dangling.
pub struct RelayPeer(Arc<PeerEndpoint>);

/// Opaque registry handle.
pub struct RelayPeerManager(PeerRegistry);

/// Opaque discovery handle.
pub struct RelayPeerDiscovery(Discovery);

/// Borrow a C string as UTF-8. None for null or invalid input.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

fn port_arg(port: c_int) -> Option<u16> {
    u16::try_from(port).ok()
}

fn into_c_string(text: String) -> *mut c_char {
    let sanitized = if text.contains('\0') {
        text.replace('\0', "")
    } else {
        text
    };
    CString::new(sanitized)
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut())
}

// ============================================================================
// Logging
// ============================================================================

/// Configure logging. Must be called before any other function to take
/// effect; later calls return 0.
///
/// `level` is one of DEBUG, INFO, WARNING, ERROR, CRITICAL. `path` may be
/// null to log to stderr only.
///
/// # Safety
/// `level` and `path` must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_configure_logging(level: *const c_char, path: *const c_char) -> c_int {
    let Some(level) = (unsafe { str_arg(level) }) else {
        return 0;
    };
    let Ok(level) = level.parse::<LogLevel>() else {
        return 0;
    };
    let file = if path.is_null() {
        None
    } else {
        match unsafe { str_arg(path) } {
            Some(path) => Some(PathBuf::from(path)),
            None => return 0,
        }
    };

    match Logger::new(&LogConfig { level, file }) {
        Ok(log) => LOGGER.set(log).is_ok() as c_int,
        Err(_) => 0,
    }
}

// ============================================================================
// Peers
// ============================================================================

/// Create a listening (`is_server != 0`) or connected peer. Null on failure.
///
/// # Safety
/// `id` and `ip` must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_create_peer(
    id: *const c_char,
    ip: *const c_char,
    port: c_int,
    is_server: c_int,
) -> *mut RelayPeer {
    let (Some(id), Some(ip), Some(port)) = (unsafe { str_arg(id) }, unsafe { str_arg(ip) }, port_arg(port))
    else {
        logger().error("relay_create_peer: invalid id, address or port");
        return ptr::null_mut();
    };

    let log = logger();
    let created = if is_server != 0 {
        PeerEndpoint::listen(id, ip, port, LISTEN_BACKLOG, log)
    } else {
        PeerEndpoint::connect(id, ip, port, log)
    };

    match created {
        Ok(peer) => Box::into_raw(Box::new(RelayPeer(Arc::new(peer)))),
        Err(e) => {
            log.error(format_args!(
                "Failed to create {} peer {} at {}:{}: {}",
                if is_server != 0 { "server" } else { "client" },
                id,
                ip,
                port,
                e
            ));
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `peer` must be null or a live handle; `message` null or a valid string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_send_message(peer: *const RelayPeer, message: *const c_char) -> c_int {
    let (Some(peer), Some(message)) = (unsafe { peer.as_ref() }, unsafe { str_arg(message) }) else {
        return 0;
    };
    peer.0.send_message(message).is_ok() as c_int
}

/// Receive one message. Returns an empty string when nothing arrived and
/// null for a null handle. Free the result with `relay_free_string`.
///
/// # Safety
/// `peer` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_receive_message(peer: *const RelayPeer) -> *mut c_char {
    let Some(peer) = (unsafe { peer.as_ref() }) else {
        return ptr::null_mut();
    };
    let message = peer.0.receive_message().ok().flatten().unwrap_or_default();
    into_c_string(message)
}

/// Accept up to `max_clients` clients. Returns how many were accepted.
///
/// # Safety
/// `peer` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_accept_clients(peer: *const RelayPeer, max_clients: c_int) -> c_int {
    let Some(peer) = (unsafe { peer.as_ref() }) else {
        return 0;
    };
    let max = usize::try_from(max_clients).unwrap_or(0);
    peer.0
        .accept_clients(max)
        .map(|n| c_int::try_from(n).unwrap_or(c_int::MAX))
        .unwrap_or(0)
}

/// Local port a peer is bound to, or 0 if closed.
///
/// # Safety
/// `peer` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_peer_local_port(peer: *const RelayPeer) -> c_int {
    unsafe { peer.as_ref() }
        .and_then(|peer| peer.0.connection().local_addr())
        .map(|addr| c_int::from(addr.port()))
        .unwrap_or(0)
}

/// # Safety
/// `peer` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_close_peer(peer: *const RelayPeer) {
    if let Some(peer) = unsafe { peer.as_ref() } {
        peer.0.close_connection();
    }
}

/// Release a peer handle. The connection stays open while a registry still
/// holds the peer.
///
/// # Safety
/// `peer` must be null or a handle from `relay_create_peer` not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_destroy_peer(peer: *mut RelayPeer) {
    if !peer.is_null() {
        drop(unsafe { Box::from_raw(peer) });
    }
}

// ============================================================================
// Registry
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn relay_create_peer_manager() -> *mut RelayPeerManager {
    Box::into_raw(Box::new(RelayPeerManager(PeerRegistry::new(logger()))))
}

/// Register a peer. The registry shares ownership of it.
///
/// # Safety
/// Both handles must be null or live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_add_peer(mgr: *const RelayPeerManager, peer: *const RelayPeer) -> c_int {
    let (Some(mgr), Some(peer)) = (unsafe { mgr.as_ref() }, unsafe { peer.as_ref() }) else {
        return 0;
    };
    mgr.0.add_peer(peer.0.clone()).is_ok() as c_int
}

/// # Safety
/// `mgr` must be null or live; the strings null or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_relay_message(
    mgr: *const RelayPeerManager,
    source_id: *const c_char,
    target_id: *const c_char,
    message: *const c_char,
) -> c_int {
    let Some(mgr) = (unsafe { mgr.as_ref() }) else {
        return 0;
    };
    let args = unsafe { (str_arg(source_id), str_arg(target_id), str_arg(message)) };
    let (Some(source), Some(target), Some(message)) = args else {
        return 0;
    };
    mgr.0.relay_message(source, target, message).is_ok() as c_int
}

/// Send `message` to every peer. Returns 1 only if every send succeeded.
///
/// # Safety
/// `mgr` must be null or live; `message` null or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_broadcast(mgr: *const RelayPeerManager, message: *const c_char) -> c_int {
    let (Some(mgr), Some(message)) = (unsafe { mgr.as_ref() }, unsafe { str_arg(message) }) else {
        return 0;
    };
    mgr.0.broadcast(message).all_delivered() as c_int
}

/// Evict peers idle for more than `timeout_secs`. Returns how many were removed.
///
/// # Safety
/// `mgr` must be null or live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_remove_inactive_peers(mgr: *const RelayPeerManager, timeout_secs: u64) -> c_int {
    let Some(mgr) = (unsafe { mgr.as_ref() }) else {
        return 0;
    };
    let removed = mgr.0.remove_inactive_peers(Duration::from_secs(timeout_secs));
    c_int::try_from(removed.len()).unwrap_or(c_int::MAX)
}

/// # Safety
/// `mgr` must be null or a handle not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_destroy_peer_manager(mgr: *mut RelayPeerManager) {
    if !mgr.is_null() {
        drop(unsafe { Box::from_raw(mgr) });
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Bind `local_ip:port` and join `group`. Null on failure.
///
/// # Safety
/// The strings must be null or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_create_peer_discovery(
    group: *const c_char,
    port: c_int,
    local_ip: *const c_char,
) -> *mut RelayPeerDiscovery {
    let (Some(group), Some(local_ip), Some(port)) =
        (unsafe { str_arg(group) }, unsafe { str_arg(local_ip) }, port_arg(port))
    else {
        logger().error("relay_create_peer_discovery: invalid group, address or port");
        return ptr::null_mut();
    };

    let config = DiscoveryConfig {
        group: group.to_string(),
        port,
        bind_address: local_ip.to_string(),
        ..Default::default()
    };
    match Discovery::new(config, logger()) {
        Ok(discovery) => Box::into_raw(Box::new(RelayPeerDiscovery(discovery))),
        Err(e) => {
            logger().error(format_args!("Failed to create peer discovery: {}", e));
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `discovery` must be null or live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_start_discovery(discovery: *const RelayPeerDiscovery) -> c_int {
    match unsafe { discovery.as_ref() } {
        Some(discovery) => discovery.0.start().is_ok() as c_int,
        None => 0,
    }
}

/// # Safety
/// `discovery` must be null or live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_stop_discovery(discovery: *const RelayPeerDiscovery) {
    if let Some(discovery) = unsafe { discovery.as_ref() } {
        discovery.0.stop();
    }
}

/// Snapshot of discovered `ip:port` strings. `*count` receives the length.
/// Returns null when there are none. Free with `relay_free_string_array`.
///
/// # Safety
/// `discovery` must be null or live; `count` null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_get_discovered_peers(
    discovery: *const RelayPeerDiscovery,
    count: *mut c_int,
) -> *mut *mut c_char {
    let Some(count) = (unsafe { count.as_mut() }) else {
        return ptr::null_mut();
    };
    *count = 0;
    let Some(discovery) = (unsafe { discovery.as_ref() }) else {
        return ptr::null_mut();
    };

    let peers: Vec<*mut c_char> = discovery
        .0
        .discovered_peers()
        .into_iter()
        .map(into_c_string)
        .filter(|p| !p.is_null())
        .collect();
    if peers.is_empty() {
        return ptr::null_mut();
    }
    let Ok(len) = c_int::try_from(peers.len()) else {
        for p in peers {
            drop(unsafe { CString::from_raw(p) });
        }
        return ptr::null_mut();
    };

    *count = len;
    Box::into_raw(peers.into_boxed_slice()).cast::<*mut c_char>()
}

/// # Safety
/// `discovery` must be null or a handle not yet destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_destroy_peer_discovery(discovery: *mut RelayPeerDiscovery) {
    if !discovery.is_null() {
        drop(unsafe { Box::from_raw(discovery) });
    }
}

// ============================================================================
// Memory
// ============================================================================

/// # Safety
/// `s` must be null or a string returned by this library, freed only once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

/// # Safety
/// `array` and `count` must come from one `relay_get_discovered_peers` call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn relay_free_string_array(array: *mut *mut c_char, count: c_int) {
    let Ok(len) = usize::try_from(count) else {
        return;
    };
    if array.is_null() || len == 0 {
        return;
    }
    let strings = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(array, len)) };
    for s in strings.iter() {
        unsafe { relay_free_string(*s) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    unsafe fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let text = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        unsafe { relay_free_string(ptr) };
        text
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        unsafe {
            let ip = c("127.0.0.1");
            assert!(relay_create_peer(ptr::null(), ip.as_ptr(), 8080, 0).is_null());
            assert_eq!(relay_send_message(ptr::null(), ip.as_ptr()), 0);
            assert!(relay_receive_message(ptr::null()).is_null());
            assert_eq!(relay_accept_clients(ptr::null(), 1), 0);
            assert_eq!(relay_add_peer(ptr::null(), ptr::null()), 0);
            assert_eq!(relay_broadcast(ptr::null(), ip.as_ptr()), 0);
            assert_eq!(relay_start_discovery(ptr::null()), 0);

            let mut count = 7;
            assert!(relay_get_discovered_peers(ptr::null(), &mut count).is_null());
            assert_eq!(count, 0);

            relay_close_peer(ptr::null());
            relay_destroy_peer(ptr::null_mut());
            relay_destroy_peer_manager(ptr::null_mut());
            relay_destroy_peer_discovery(ptr::null_mut());
            relay_free_string(ptr::null_mut());
            relay_free_string_array(ptr::null_mut(), 0);
        }
    }

    #[test]
    fn test_invalid_peer_arguments() {
        unsafe {
            let ip = c("127.0.0.1");
            let empty = c("");
            assert!(relay_create_peer(empty.as_ptr(), ip.as_ptr(), 8080, 1).is_null());

            let id = c("p");
            assert!(relay_create_peer(id.as_ptr(), ip.as_ptr(), 70000, 1).is_null());

            let bad_ip = c("not-an-ip");
            assert!(relay_create_peer(id.as_ptr(), bad_ip.as_ptr(), 8080, 1).is_null());
        }
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        unsafe {
            let level = c("LOUD");
            assert_eq!(relay_configure_logging(level.as_ptr(), ptr::null()), 0);
            assert_eq!(relay_configure_logging(ptr::null(), ptr::null()), 0);
        }
    }

    #[test]
    fn test_peer_roundtrip() {
        unsafe {
            let ip = c("127.0.0.1");
            let server_id = c("server");
            let server = relay_create_peer(server_id.as_ptr(), ip.as_ptr(), 0, 1);
            assert!(!server.is_null());
            let port = relay_peer_local_port(server);
            assert!(port > 0);

            let client_id = c("client");
            let client = relay_create_peer(client_id.as_ptr(), ip.as_ptr(), port, 0);
            assert!(!client.is_null());
            assert_eq!(relay_accept_clients(server, 1), 1);

            let ping = c("ping");
            assert_eq!(relay_send_message(client, ping.as_ptr()), 1);
            assert_eq!(take_string(relay_receive_message(server)), "ping");

            relay_close_peer(client);
            assert_eq!(relay_send_message(client, ping.as_ptr()), 0);

            relay_destroy_peer(client);
            relay_destroy_peer(server);
        }
    }

    #[test]
    fn test_manager_relay_and_broadcast() {
        unsafe {
            let ip = c("127.0.0.1");
            let hub_id = c("hub");
            let hub = relay_create_peer(hub_id.as_ptr(), ip.as_ptr(), 0, 1);
            let port = relay_peer_local_port(hub);

            let b_id = c("b");
            let b = relay_create_peer(b_id.as_ptr(), ip.as_ptr(), port, 0);
            assert_eq!(relay_accept_clients(hub, 1), 1);
            let a_id = c("a");
            let a = relay_create_peer(a_id.as_ptr(), ip.as_ptr(), port, 0);
            assert_eq!(relay_accept_clients(hub, 1), 1);

            let mgr = relay_create_peer_manager();
            assert_eq!(relay_add_peer(mgr, a), 1);
            assert_eq!(relay_add_peer(mgr, b), 1);
            assert_eq!(relay_add_peer(mgr, b), 0);

            // The registry keeps its own reference once the handle is gone.
            relay_destroy_peer(b);

            let hi = c("hi");
            let ghost = c("ghost");
            assert_eq!(relay_relay_message(mgr, a_id.as_ptr(), ghost.as_ptr(), hi.as_ptr()), 0);
            assert_eq!(relay_relay_message(mgr, a_id.as_ptr(), b_id.as_ptr(), hi.as_ptr()), 1);
            assert_eq!(take_string(relay_receive_message(hub)), "[Relayed] hi");

            let everyone = c("everyone");
            assert_eq!(relay_broadcast(mgr, everyone.as_ptr()), 1);
            assert_eq!(relay_remove_inactive_peers(mgr, 3600), 0);

            relay_destroy_peer_manager(mgr);
            relay_destroy_peer(a);
            relay_destroy_peer(hub);
        }
    }

    #[test]
    fn test_invalid_discovery_group() {
        unsafe {
            let group = c("10.0.0.1");
            let local = c("0.0.0.0");
            assert!(relay_create_peer_discovery(group.as_ptr(), 0, local.as_ptr()).is_null());
            assert!(relay_create_peer_discovery(ptr::null(), 0, local.as_ptr()).is_null());
        }
    }

    #[test]
    fn test_discovered_peer_array_layout() {
        let peers: Vec<*mut c_char> = ["10.0.0.1:5353", "10.0.0.2:5353"]
            .iter()
            .map(|s| into_c_string(s.to_string()))
            .collect();
        let array = Box::into_raw(peers.into_boxed_slice()).cast::<*mut c_char>();

        unsafe {
            let second = CStr::from_ptr(*array.add(1)).to_str().unwrap();
            assert_eq!(second, "10.0.0.2:5353");
            relay_free_string_array(array, 2);
        }
    }
}
