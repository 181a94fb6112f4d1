//! Federation configuration for an intercom server.
//!
//! Loaded from a JSON file (missing fields take their defaults) and then
//! overlaid with the `FEDERATION_*` environment variables.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FederationError;
use crate::identity::ServerId;

/// Configuration for the federation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// When false, `start()` logs and leaves the engine idle.
    pub enabled: bool,

    /// Id of this server in the mesh. Must be unique across peers.
    pub server_id: String,

    /// Human-readable name sent in the handshake.
    pub server_name: String,

    /// URL peers use to dial this server (without the `/federation` path).
    pub server_url: String,

    /// Optional public key advertised in the handshake.
    pub public_key: Option<String>,

    /// Address the federation listener binds to.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Shared secret used to sign and verify handshake tokens.
    pub federation_secret: String,

    /// Peers registered at startup.
    pub peers: Vec<PeerConfig>,

    /// Interval between heartbeats on an authenticated link.
    #[serde(with = "duration_ms_serde")]
    pub heartbeat_interval: Duration,

    /// Fixed delay before an outbound reconnect attempt.
    #[serde(with = "duration_ms_serde")]
    pub reconnect_interval: Duration,

    /// Consecutive failed reconnects after which retrying stops.
    pub max_reconnect_attempts: u32,

    /// Maximum number of simultaneous live links.
    pub max_connections: usize,

    /// A link that has not authenticated within this window is closed.
    #[serde(with = "duration_ms_serde")]
    pub handshake_timeout: Duration,

    /// Upper bound on dialing a peer (TCP connect + WebSocket upgrade).
    #[serde(with = "duration_ms_serde")]
    pub connect_timeout: Duration,

    /// Validity window of issued handshake tokens.
    #[serde(with = "duration_ms_serde")]
    pub token_ttl: Duration,

    /// Per-peer mailbox cap. `None` keeps every queued message; when set,
    /// the oldest message is dropped to make room.
    pub mailbox_capacity: Option<usize>,

    /// Advertised in capabilities only.
    pub encryption_enabled: bool,

    /// Advertised in capabilities only.
    pub compression_enabled: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_id: "intercom-server-01".to_string(),
            server_name: "Trading Intercom Server".to_string(),
            server_url: "ws://localhost:3002".to_string(),
            public_key: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3002)),
            federation_secret: String::new(),
            peers: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            max_connections: 10,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            token_ttl: Duration::from_secs(3600),
            mailbox_capacity: None,
            encryption_enabled: false,
            compression_enabled: false,
        }
    }
}

/// A peer entry, as found in config files, `FEDERATION_PEERS`, imports and
/// `add_peer` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub server_id: ServerId,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl PeerConfig {
    pub fn new(
        server_id: impl Into<String>,
        server_name: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            server_id: ServerId::from_string(server_id),
            server_name: server_name.into(),
            server_url: server_url.into(),
            public_key: None,
            is_active: true,
        }
    }

    /// Check the fields an operator must supply for a peer.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.server_id.is_empty() {
            return Err(FederationError::Config("peer serverId is required".into()));
        }
        if self.server_name.trim().is_empty() {
            return Err(FederationError::Config(format!(
                "peer {} has no serverName",
                self.server_id
            )));
        }
        validate_ws_url(&self.server_url)
            .map_err(|e| FederationError::Config(format!("peer {}: {e}", self.server_id)))
    }
}

impl FederationConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), FederationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file. A missing, unreadable or corrupt file
    /// is an error.
    pub fn load_from_file(path: &Path) -> Result<Self, FederationError> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| FederationError::Config(format!("{}: {e}", path.display())))
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        Self::load_from_file(path).unwrap_or_else(|e| {
            tracing::warn!("Unusable federation config, using defaults: {e}");
            Self::default()
        })
    }

    /// Overlay the `FEDERATION_*` process environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), FederationError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay variables resolved through `lookup`. Unset variables leave the
    /// current value alone; unparsable ones are an error.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), FederationError> {
        if let Some(v) = lookup("FEDERATION_ENABLED") {
            self.enabled = parse_bool("FEDERATION_ENABLED", &v)?;
        }
        if let Some(v) = lookup("FEDERATION_SERVER_ID") {
            self.server_id = v;
        }
        if let Some(v) = lookup("FEDERATION_SERVER_NAME") {
            self.server_name = v;
        }
        if let Some(v) = lookup("FEDERATION_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("FEDERATION_PORT") {
            let port: u16 = parse_var("FEDERATION_PORT", &v)?;
            self.listen_addr.set_port(port);
        }
        if let Some(v) = lookup("FEDERATION_SECRET") {
            self.federation_secret = v;
        }
        if let Some(v) = lookup("FEDERATION_PEERS") {
            self.peers = serde_json::from_str(&v).map_err(|e| {
                FederationError::Config(format!("FEDERATION_PEERS is not a peer list: {e}"))
            })?;
        }
        if let Some(v) = lookup("FEDERATION_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval =
                Duration::from_millis(parse_var("FEDERATION_HEARTBEAT_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("FEDERATION_RECONNECT_INTERVAL") {
            self.reconnect_interval =
                Duration::from_millis(parse_var("FEDERATION_RECONNECT_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("FEDERATION_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse_var("FEDERATION_MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("FEDERATION_MAX_CONNECTIONS") {
            self.max_connections = parse_var("FEDERATION_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("FEDERATION_ENCRYPTION_ENABLED") {
            self.encryption_enabled = parse_bool("FEDERATION_ENCRYPTION_ENABLED", &v)?;
        }
        if let Some(v) = lookup("FEDERATION_COMPRESSION_ENABLED") {
            self.compression_enabled = parse_bool("FEDERATION_COMPRESSION_ENABLED", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.server_id.trim().is_empty() {
            return Err(FederationError::Config("server_id must not be empty".into()));
        }
        if self.federation_secret.is_empty() {
            return Err(FederationError::Config(
                "federation_secret must be set".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.reconnect_interval.is_zero() {
            return Err(FederationError::Config(
                "heartbeat and reconnect intervals must be non-zero".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(FederationError::Config("max_connections must be at least 1".into()));
        }
        if self.mailbox_capacity == Some(0) {
            return Err(FederationError::Config("mailbox_capacity must be at least 1".into()));
        }
        validate_ws_url(&self.server_url).map_err(FederationError::Config)?;
        if let Some(peer) = self.peers.iter().find(|p| p.server_id.as_str() == self.server_id) {
            return Err(FederationError::Config(format!(
                "peer list contains the local server {}",
                peer.server_id
            )));
        }
        Ok(())
    }
}

fn validate_ws_url(raw: &str) -> Result<(), String> {
    let url = url::Url::parse(raw).map_err(|e| format!("invalid server URL '{raw}': {e}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(format!("server URL '{raw}' has unsupported scheme '{other}'")),
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, FederationError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| FederationError::Config(format!("{key}={value}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, FederationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FederationError::Config(format!("{key}={value}: expected a boolean"))),
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = FederationConfig::default();
        assert!(config.enabled);
        assert_eq!(config.server_id, "intercom-server-01");
        assert_eq!(config.listen_addr.port(), 3002);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.token_ttl, Duration::from_secs(3600));
        assert!(config.mailbox_capacity.is_none());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = FederationConfig::default();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["heartbeat_interval"], 30_000);
        assert_eq!(value["reconnect_interval"], 5_000);
        assert_eq!(value["listen_addr"], "0.0.0.0:3002");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{
            "server_id": "srv-1",
            "heartbeat_interval": 250,
            "peers": [{"serverId": "srv-2", "serverName": "Two", "serverUrl": "ws://10.0.0.2:3002"}]
        }"#;
        let config: FederationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server_id, "srv-1");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.peers.len(), 1);
        assert!(config.peers[0].is_active);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("federation.json");

        let mut original = FederationConfig::default();
        original.server_id = "srv-7".into();
        original.mailbox_capacity = Some(64);
        original.peers = vec![PeerConfig::new("srv-8", "Eight", "ws://srv-8:3002")];
        original.save_to_file(&path).unwrap();

        let loaded = FederationConfig::load_or_default(&path);
        assert_eq!(loaded.server_id, "srv-7");
        assert_eq!(loaded.mailbox_capacity, Some(64));
        assert_eq!(loaded.peers, original.peers);
    }

    #[test]
    fn test_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, "{ definitely not json").unwrap();

        let config = FederationConfig::load_or_default(&path);
        assert_eq!(config.server_id, "intercom-server-01");

        let err = FederationConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, FederationError::Config(_)), "got {err}");
    }

    #[test]
    fn test_load_from_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FederationConfig::load_from_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, FederationError::Io(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FederationConfig::default();
        let lookup = lookup_from(&[
            ("FEDERATION_SERVER_ID", "srv-east"),
            ("FEDERATION_PORT", "4100"),
            ("FEDERATION_SECRET", "s3cret"),
            ("FEDERATION_HEARTBEAT_INTERVAL", "1500"),
            ("FEDERATION_MAX_RECONNECT_ATTEMPTS", "9"),
            ("FEDERATION_ENCRYPTION_ENABLED", "true"),
            (
                "FEDERATION_PEERS",
                r#"[{"serverId":"srv-west","serverName":"West","serverUrl":"ws://west:4100","isActive":false}]"#,
            ),
        ]);
        config.apply_overrides(lookup).unwrap();

        assert_eq!(config.server_id, "srv-east");
        assert_eq!(config.listen_addr.port(), 4100);
        assert_eq!(config.federation_secret, "s3cret");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.max_reconnect_attempts, 9);
        assert!(config.encryption_enabled);
        assert_eq!(config.peers.len(), 1);
        assert!(!config.peers[0].is_active);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = FederationConfig::default();
        let result = config.apply_overrides(lookup_from(&[("FEDERATION_PORT", "not-a-port")]));
        assert!(matches!(result, Err(FederationError::Config(_))));

        let result = config.apply_overrides(lookup_from(&[("FEDERATION_ENABLED", "maybe")]));
        assert!(matches!(result, Err(FederationError::Config(_))));
    }

    #[test]
    fn test_validate() {
        let mut config = FederationConfig::default();
        assert!(config.validate().is_err(), "empty secret must be rejected");

        config.federation_secret = "secret".into();
        config.validate().unwrap();

        config.server_url = "http://localhost:3002".into();
        assert!(config.validate().is_err());
        config.server_url = "ws://localhost:3002".into();

        config.peers = vec![PeerConfig::new("intercom-server-01", "Me", "ws://localhost:3002")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_config_validate() {
        PeerConfig::new("srv-2", "Two", "ws://127.0.0.1:3002")
            .validate()
            .unwrap();
        assert!(PeerConfig::new("", "Two", "ws://127.0.0.1:3002").validate().is_err());
        assert!(PeerConfig::new("srv-2", "", "ws://127.0.0.1:3002").validate().is_err());
        assert!(PeerConfig::new("srv-2", "Two", "not a url").validate().is_err());
    }
}
