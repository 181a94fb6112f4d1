//! Federation wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator, the sender's
//! `serverId` and a millisecond `timestamp`. Frames are decoded into
//! [`FederationMessage`] once, at the transport boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FederationError;
use crate::identity::{Capabilities, ServerId, ServerIdentity};
use crate::sync::{SyncFrame, SyncKind};

/// A decoded federation frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FederationMessage {
    // ── Handshake ───────────────────────────────────────────────────
    Auth(AuthRequest),
    AuthResponse(AuthResponse),

    // ── Liveness ────────────────────────────────────────────────────
    Heartbeat(Heartbeat),
    HeartbeatResponse(Heartbeat),

    // ── Sync family ─────────────────────────────────────────────────
    Sync(SyncFrame),
}

/// Sent by the dialer as soon as the link opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub server_id: ServerId,
    pub server_name: String,
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Authenticated,
    Failed,
}

/// The acceptor's verdict on an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub server_id: ServerId,
    #[serde(default)]
    pub server_name: String,
    pub status: AuthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Body of both `heartbeat` and `heartbeat_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    #[serde(default)]
    pub server_id: ServerId,
    #[serde(default)]
    pub timestamp: i64,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl AuthResponse {
    pub fn authenticated(local: &ServerIdentity) -> Self {
        Self {
            server_id: local.server_id.clone(),
            server_name: local.server_name.clone(),
            status: AuthStatus::Authenticated,
            capabilities: Some(local.capabilities.clone()),
            error: None,
            timestamp: now_millis(),
        }
    }

    pub fn failed(local: &ServerIdentity, error: impl Into<String>) -> Self {
        Self {
            server_id: local.server_id.clone(),
            server_name: local.server_name.clone(),
            status: AuthStatus::Failed,
            capabilities: None,
            error: Some(error.into()),
            timestamp: now_millis(),
        }
    }
}

impl Heartbeat {
    pub fn now(server_id: &ServerId) -> Self {
        Self {
            server_id: server_id.clone(),
            timestamp: now_millis(),
        }
    }
}

impl FederationMessage {
    /// The `type` discriminator of this frame.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::AuthResponse(_) => "auth_response",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatResponse(_) => "heartbeat_response",
            Self::Sync(frame) => frame.kind.wire_type(),
        }
    }

    /// The server that produced this frame.
    pub fn server_id(&self) -> &ServerId {
        match self {
            Self::Auth(m) => &m.server_id,
            Self::AuthResponse(m) => &m.server_id,
            Self::Heartbeat(m) | Self::HeartbeatResponse(m) => &m.server_id,
            Self::Sync(frame) => &frame.server_id,
        }
    }

    /// Encode to a JSON object.
    pub fn to_value(&self) -> Result<Value, FederationError> {
        let mut value = match self {
            Self::Auth(m) => serde_json::to_value(m)?,
            Self::AuthResponse(m) => serde_json::to_value(m)?,
            Self::Heartbeat(m) | Self::HeartbeatResponse(m) => serde_json::to_value(m)?,
            Self::Sync(frame) => return Ok(frame.to_value()),
        };
        if let Value::Object(map) = &mut value {
            map.insert("type".into(), Value::from(self.wire_type()));
        }
        Ok(value)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, FederationError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Decode a JSON frame. Malformed frames and unknown types are
    /// [`FederationError::Protocol`] errors.
    pub fn from_json(text: &str) -> Result<Self, FederationError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FederationError::Protocol(format!("malformed frame: {e}")))?;
        Self::from_value(value)
    }

    /// The `type` of a raw frame, read without decoding the rest of it.
    pub fn frame_type(text: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type")]
            kind: String,
        }
        serde_json::from_str::<Tagged>(text).ok().map(|t| t.kind)
    }

    pub fn from_value(value: Value) -> Result<Self, FederationError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FederationError::Protocol("frame has no type".into()))?
            .to_string();

        let body_error =
            |e: serde_json::Error| FederationError::Protocol(format!("bad {tag} frame: {e}"));
        match tag.as_str() {
            "auth" => serde_json::from_value(value).map(Self::Auth).map_err(body_error),
            "auth_response" => serde_json::from_value(value)
                .map(Self::AuthResponse)
                .map_err(body_error),
            "heartbeat" => serde_json::from_value(value)
                .map(Self::Heartbeat)
                .map_err(body_error),
            "heartbeat_response" => serde_json::from_value(value)
                .map(Self::HeartbeatResponse)
                .map_err(body_error),
            other => match SyncKind::from_wire_type(other) {
                Some(kind) => SyncFrame::from_value(kind, value).map(Self::Sync),
                None => Err(FederationError::Protocol(format!(
                    "unknown message type '{other}'"
                ))),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
