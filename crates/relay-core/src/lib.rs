//! relay-core: Local-network peer relay.
//!
//! This crate provides the core functionality for:
//! - Socket connections in stream-server, stream-client and datagram modes
//! - Peer endpoints with traffic counters and latency estimates
//! - A peer registry that relays and broadcasts text messages
//! - UDP multicast discovery of other relay nodes
//!
//! Every component takes an explicit [`Logger`] at construction time.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod message;
pub mod peer;
pub mod registry;

pub use config::{NodeConfig, RelayConfig};
pub use connection::{AddressFamily, Connection, SocketMode};
pub use discovery::{Discovery, DiscoveryConfig};
pub use error::{ErrorClass, RelayError, Result};
pub use logging::{LogConfig, LogLevel, Logger};
pub use message::DiscoveryMessage;
pub use peer::{PeerEndpoint, PeerStats};
pub use registry::{BroadcastReport, PeerRegistry, RELAY_MARKER};
