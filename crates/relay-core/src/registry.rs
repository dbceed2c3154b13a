//! Peer registry for relaying and broadcasting messages.
//!
//! One `RwLock` guards the id → endpoint map. It is only held long enough to
//! look up or snapshot endpoints; every send happens after it is released.

use crate::error::{RelayError, Result};
use crate::logging::Logger;
use crate::peer::PeerEndpoint;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// Prepended to every relayed payload.
pub const RELAY_MARKER: &str = "[Relayed] ";

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Ids of peers whose send failed
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<PeerEndpoint>>>,
    log: Logger,
}

impl PeerRegistry {
    pub fn new(log: &Logger) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            log: log.clone(),
        }
    }

    /// Register a peer. A duplicate id is rejected and the existing peer kept.
    pub fn add_peer(&self, peer: Arc<PeerEndpoint>) -> Result<()> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());

        if peers.contains_key(peer.id()) {
            drop(peers);
            self.log
                .error(format_args!("Peer with ID already exists: {}", peer.id()));
            return Err(RelayError::DuplicateId(peer.id().to_string()));
        }

        let id = peer.id().to_string();
        peers.insert(id.clone(), peer);
        drop(peers);
        self.log.info(format_args!("Added peer with ID: {}", id));
        Ok(())
    }

    /// Called when discovery hands over a new peer.
    pub fn on_peer_discovery(&self, peer: Arc<PeerEndpoint>) -> Result<()> {
        self.add_peer(peer)
    }

    /// Returns true if a peer was removed.
    pub fn remove_peer(&self, id: &str) -> bool {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();

        if removed {
            self.log.info(format_args!("Removed peer with ID: {}", id));
        } else {
            self.log
                .warn(format_args!("Cannot remove unknown peer: {}", id));
        }
        removed
    }

    pub fn get_peer(&self, id: &str) -> Option<Arc<PeerEndpoint>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all peers, sorted by id.
    pub fn list_peers(&self) -> Vec<Arc<PeerEndpoint>> {
        let mut peers: Vec<_> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id().cmp(b.id()));
        peers
    }

    /// Forward `message` from `source` to `target` with the relay marker.
    pub fn relay_message(&self, source: &str, target: &str, message: &str) -> Result<()> {
        let (from, to) = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            (peers.get(source).cloned(), peers.get(target).cloned())
        };

        let (from, to) = match (from, to) {
            (Some(from), Some(to)) => (from, to),
            (from, _) => {
                let missing = if from.is_none() { source } else { target };
                self.log.error(format_args!(
                    "Relay from {} to {} failed: peer not found: {}",
                    source, target, missing
                ));
                return Err(RelayError::PeerNotFound(missing.to_string()));
            }
        };

        let relayed = format!("{}{}", RELAY_MARKER, message);
        match to.send_message(&relayed) {
            Ok(_) => {
                from.touch();
                to.touch();
                self.log.info(format_args!(
                    "Relayed message from {} to {}: {}",
                    source, target, message
                ));
                Ok(())
            }
            Err(e) => {
                self.log.debug(format_args!(
                    "Failed to relay message from {} to {}: {}",
                    source, target, e
                ));
                Err(e)
            }
        }
    }

    /// Send `message` to every registered peer, continuing past failures.
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let peers = self.list_peers();
        let mut report = BroadcastReport {
            attempted: peers.len(),
            ..Default::default()
        };

        for peer in &peers {
            match peer.send_message(message) {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    self.log.debug(format_args!(
                        "Broadcast to peer {} failed: {}",
                        peer.id(),
                        e
                    ));
                    report.failed.push(peer.id().to_string());
                }
            }
        }

        self.log.info(format_args!(
            "Broadcast message to {}/{} peers: {}",
            report.delivered, report.attempted, message
        ));
        report
    }

    /// Insert every peer whose id is not yet known. Returns how many were added.
    pub fn add_discovered_peers(&self, discovered: Vec<Arc<PeerEndpoint>>) -> usize {
        let mut added = Vec::new();
        let mut skipped = Vec::new();
        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            for peer in discovered {
                if peers.contains_key(peer.id()) {
                    skipped.push(peer.id().to_string());
                } else {
                    added.push(peer.id().to_string());
                    peers.insert(peer.id().to_string(), peer);
                }
            }
        }

        for id in &skipped {
            self.log
                .info(format_args!("Skipped adding already known peer: {}", id));
        }
        for id in &added {
            self.log
                .info(format_args!("Added discovered peer with ID: {}", id));
        }
        added.len()
    }

    /// Evict peers idle for longer than `timeout`. Returns the removed ids.
    pub fn remove_inactive_peers(&self, timeout: Duration) -> Vec<String> {
        self.remove_inactive_peers_at(SystemTime::now(), timeout)
    }

    /// Evict peers whose last activity is more than `timeout` before `now`.
    pub fn remove_inactive_peers_at(&self, now: SystemTime, timeout: Duration) -> Vec<String> {
        let mut removed = Vec::new();
        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.retain(|id, peer| {
                let idle = now
                    .duration_since(peer.last_active())
                    .unwrap_or(Duration::ZERO);
                if idle > timeout {
                    removed.push(id.clone());
                    false
                } else {
                    true
                }
            });
        }

        removed.sort();
        for id in &removed {
            self.log
                .info(format_args!("Removed inactive peer with ID: {}", id));
        }
        removed
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.len())
            .finish()
    }
}
