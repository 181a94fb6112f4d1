//! Server identity: the id every federation frame is keyed by, and the
//! capability flags a server advertises during the handshake.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FederationConfig;

/// Unique identifier of a server in the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    /// Create a ServerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Feature flags a server advertises in `auth` / `auth_response`.
///
/// Flags this build does not know about are kept in `extra` so they survive
/// a round trip through the registry. Known flags are read loosely (`1`,
/// `"yes"`, `null`) so one odd value does not fail the whole handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    #[serde(deserialize_with = "lenient::flag")]
    pub audio_routing: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub group_management: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub user_management: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub recording: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub matrix_integration: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub sip_integration: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub encryption: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub compression: bool,
    #[serde(deserialize_with = "lenient::count")]
    pub max_connections: usize,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Capabilities {
    /// The capability set of a server running this engine.
    pub fn local(config: &FederationConfig) -> Self {
        Self {
            audio_routing: true,
            group_management: true,
            user_management: true,
            recording: true,
            matrix_integration: true,
            sip_integration: true,
            encryption: config.encryption_enabled,
            compression: config.compression_enabled,
            max_connections: config.max_connections,
            extra: BTreeMap::new(),
        }
    }
}

/// How the local server presents itself to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIdentity {
    pub server_id: ServerId,
    pub server_name: String,
    pub server_url: String,
    /// Advertised to peers but not used to verify anything yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub capabilities: Capabilities,
}

impl ServerIdentity {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            server_id: ServerId::from_string(config.server_id.clone()),
            server_name: config.server_name.clone(),
            server_url: config.server_url.clone(),
            public_key: config.public_key.clone(),
            capabilities: Capabilities::local(config),
        }
    }
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Booleans, non-zero numbers and `"true"`/`"1"`/`"yes"` are set;
    /// anything else reads as unset.
    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ),
            _ => false,
        })
    }

    /// Non-negative integers, also when sent as strings; anything else is 0.
    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64().and_then(|v| usize::try_from(v).ok()).unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
