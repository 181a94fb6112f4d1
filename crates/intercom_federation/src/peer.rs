//! Peer registry: known peer servers and their last known link state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PeerConfig;
use crate::identity::{Capabilities, ServerId};

/// Link state of a peer, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link, none in progress.
    Disconnected,
    /// Dialing the peer's URL.
    Connecting,
    /// Link open, handshake in progress.
    Authenticating,
    /// Handshake complete; the link carries sync traffic.
    Connected,
    /// The last link attempt or link ended in an error.
    Error,
}

/// Identity and last known state of a remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub server_id: ServerId,
    pub server_name: String,
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub capabilities: Capabilities,
    /// Administratively enabled. Only active peers are dialed and redialed.
    pub is_active: bool,
    pub connection_status: ConnectionStatus,
    /// Last heartbeat or successful handshake.
    pub last_seen: Option<DateTime<Utc>>,
    /// When the current (or last) link reached `connected`.
    pub connected_at: Option<DateTime<Utc>>,
}

impl PeerRecord {
    pub fn from_config(peer: &PeerConfig) -> Self {
        Self {
            server_id: peer.server_id.clone(),
            server_name: peer.server_name.clone(),
            server_url: peer.server_url.clone(),
            public_key: peer.public_key.clone(),
            capabilities: Capabilities::default(),
            is_active: peer.is_active,
            connection_status: ConnectionStatus::Disconnected,
            last_seen: None,
            connected_at: None,
        }
    }

    /// The administrative part of the record, as exported.
    pub fn to_config(&self) -> PeerConfig {
        PeerConfig {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            server_url: self.server_url.clone(),
            public_key: self.public_key.clone(),
            is_active: self.is_active,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }
}

/// Registry of all known peers, ordered by server id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<ServerId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, replacing any record with the same id.
    pub fn upsert(&mut self, record: PeerRecord) {
        self.peers.insert(record.server_id.clone(), record);
    }

    pub fn get(&self, server_id: &ServerId) -> Option<&PeerRecord> {
        self.peers.get(server_id)
    }

    pub fn get_mut(&mut self, server_id: &ServerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(server_id)
    }

    pub fn contains(&self, server_id: &ServerId) -> bool {
        self.peers.contains_key(server_id)
    }

    /// Remove a peer. Returns whether it was known.
    pub fn remove(&mut self, server_id: &ServerId) -> bool {
        self.peers.remove(server_id).is_some()
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Ids of peers whose status is `connected`.
    pub fn connected_ids(&self) -> Vec<ServerId> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.server_id.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    /// Set a peer's status, stamping `connected_at` on entry to `connected`.
    pub fn set_status(&mut self, server_id: &ServerId, status: ConnectionStatus) {
        if let Some(peer) = self.peers.get_mut(server_id) {
            if status == ConnectionStatus::Connected && !peer.is_connected() {
                peer.connected_at = Some(Utc::now());
            }
            peer.connection_status = status;
        }
    }

    /// Record that the peer was just heard from.
    pub fn touch(&mut self, server_id: &ServerId) {
        if let Some(peer) = self.peers.get_mut(server_id) {
            peer.last_seen = Some(Utc::now());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(id: &str) -> PeerRecord {
        PeerRecord::from_config(&PeerConfig::new(id, format!("Server {id}"), "ws://127.0.0.1:3002"))
    }

    #[test]
    fn test_registry_upsert_and_get() {
        let mut registry = PeerRegistry::new();
        registry.upsert(make_peer("srv-2"));
        assert_eq!(registry.total_count(), 1);

        let peer = registry.get(&ServerId::from("srv-2")).unwrap();
        assert_eq!(peer.connection_status, ConnectionStatus::Disconnected);
        assert!(peer.last_seen.is_none());
        assert!(registry.get(&ServerId::from("srv-3")).is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let mut registry = PeerRegistry::new();
        registry.upsert(make_peer("srv-2"));
        let mut renamed = make_peer("srv-2");
        renamed.server_name = "Renamed".into();
        registry.upsert(renamed);

        assert_eq!(registry.total_count(), 1);
        assert_eq!(registry.get(&ServerId::from("srv-2")).unwrap().server_name, "Renamed");
    }

    #[test]
    fn test_registry_remove() {
        let mut registry = PeerRegistry::new();
        registry.upsert(make_peer("srv-2"));
        assert!(registry.remove(&ServerId::from("srv-2")));
        assert!(!registry.remove(&ServerId::from("srv-2")));
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_status_transitions_stamp_connected_at() {
        let mut registry = PeerRegistry::new();
        let id = ServerId::from("srv-2");
        registry.upsert(make_peer("srv-2"));

        registry.set_status(&id, ConnectionStatus::Connecting);
        registry.set_status(&id, ConnectionStatus::Authenticating);
        assert!(registry.get(&id).unwrap().connected_at.is_none());

        registry.set_status(&id, ConnectionStatus::Connected);
        let peer = registry.get(&id).unwrap();
        assert!(peer.is_connected());
        assert!(peer.connected_at.is_some());
    }

    #[test]
    fn test_connected_counts() {
        let mut registry = PeerRegistry::new();
        for id in ["srv-2", "srv-3", "srv-4"] {
            registry.upsert(make_peer(id));
        }
        registry.set_status(&ServerId::from("srv-2"), ConnectionStatus::Connected);
        registry.set_status(&ServerId::from("srv-4"), ConnectionStatus::Connected);
        registry.set_status(&ServerId::from("srv-3"), ConnectionStatus::Error);

        assert_eq!(registry.connected_count(), 2);
        assert_eq!(
            registry.connected_ids(),
            vec![ServerId::from("srv-2"), ServerId::from("srv-4")]
        );
        assert_eq!(registry.all().len(), 3);
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let mut registry = PeerRegistry::new();
        let id = ServerId::from("srv-2");
        registry.upsert(make_peer("srv-2"));
        registry.touch(&id);
        assert!(registry.get(&id).unwrap().last_seen.is_some());
    }

    #[test]
    fn test_record_wire_names() {
        let value = serde_json::to_value(make_peer("srv-2")).unwrap();
        assert_eq!(value["serverId"], "srv-2");
        assert_eq!(value["connectionStatus"], "disconnected");
        assert_eq!(value["isActive"], true);
    }

    #[test]
    fn test_to_config_round_trip() {
        let mut config = PeerConfig::new("srv-5", "Five", "ws://five:3002");
        config.is_active = false;
        let record = PeerRecord::from_config(&config);
        assert_eq!(record.to_config(), config);
    }
}
