//! Connected peers and their drive-topic subscriptions.

use std::collections::{HashMap, HashSet};

use libp2p::{Multiaddr, PeerId};
use tracing::debug;

use peerdrive_shared::types::ConnectionMode;

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub address: Multiaddr,
    pub mode: ConnectionMode,
    /// Unix epoch millis.
    pub connected_at: u64,
}

/// Swarm-local view of who is connected and which drive topics they carry.
#[derive(Debug, Default)]
pub struct PeerTracker {
    peers: HashMap<PeerId, ConnectionInfo>,
    topics: HashMap<String, HashSet<PeerId>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr, is_relayed: bool) {
        let mode = if is_relayed {
            ConnectionMode::Relayed
        } else {
            ConnectionMode::Direct
        };
        let connected_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        debug!(peer = %peer_id, addr = %address, mode = ?mode, "Tracking peer");
        self.peers.insert(
            peer_id,
            ConnectionInfo {
                peer_id,
                address,
                mode,
                connected_at,
            },
        );
    }

    /// Forget a fully disconnected peer, including its subscriptions.
    pub fn on_disconnected(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
        self.topics.retain(|_, members| {
            members.remove(peer_id);
            !members.is_empty()
        });
    }

    pub fn on_subscribed(&mut self, peer_id: PeerId, topic: &str) {
        self.topics.entry(topic.to_string()).or_default().insert(peer_id);
    }

    pub fn on_unsubscribed(&mut self, peer_id: &PeerId, topic: &str) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(peer_id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.topics
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_mode(&self, peer_id: &PeerId) -> ConnectionMode {
        self.peers
            .get(peer_id)
            .map(|info| info.mode.clone())
            .unwrap_or(ConnectionMode::Disconnected)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
