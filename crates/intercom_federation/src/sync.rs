//! Sync frames: the typed intents replicated to peer subsystems.
//!
//! Every sync family shares one shape (entity id, action, entity data) but
//! names its fields after the entity on the wire, e.g. `groupId`/`groupData`
//! for `group_sync`. [`SyncKind`] knows the field names; [`SyncFrame`] is the
//! decoded form the router works with.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::FederationError;
use crate::identity::ServerId;

// ---------------------------------------------------------------------------
// Kinds and actions
// ---------------------------------------------------------------------------

/// The sync family a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    Group,
    User,
    AudioRoute,
    Recording,
    MatrixRoom,
}

impl SyncKind {
    pub const ALL: [SyncKind; 5] = [
        Self::Group,
        Self::User,
        Self::AudioRoute,
        Self::Recording,
        Self::MatrixRoom,
    ];

    /// The `type` discriminator on the wire.
    pub fn wire_type(self) -> &'static str {
        match self {
            Self::Group => "group_sync",
            Self::User => "user_sync",
            Self::AudioRoute => "audio_route",
            Self::Recording => "recording_sync",
            Self::MatrixRoom => "matrix_sync",
        }
    }

    pub fn from_wire_type(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.wire_type() == tag)
    }

    /// Name of the entity-id field.
    pub fn id_field(self) -> &'static str {
        match self {
            Self::Group => "groupId",
            Self::User => "userId",
            Self::AudioRoute => "routeId",
            Self::Recording => "recordingId",
            Self::MatrixRoom => "roomId",
        }
    }

    /// Name of the entity-data field.
    pub fn data_field(self) -> &'static str {
        match self {
            Self::Group => "groupData",
            Self::User => "userData",
            Self::AudioRoute => "routeData",
            Self::Recording => "recordingData",
            Self::MatrixRoom => "roomData",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_type())
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    Join,
    Leave,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "join" => Ok(Self::Join),
            "leave" => Ok(Self::Leave),
            other => Err(FederationError::Protocol(format!("unknown sync action '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A decoded sync-family frame.
///
/// `action` stays a raw string so that frames with an action this build does
/// not know still decode; the router logs and drops those.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFrame {
    pub kind: SyncKind,
    pub entity_id: String,
    pub action: String,
    pub data: Value,
    /// Milliseconds since the epoch, as stamped by the origin server.
    pub timestamp: i64,
    /// The origin server.
    pub server_id: ServerId,
    /// Top-level fields outside the common shape, kept verbatim.
    pub extra: Map<String, Value>,
}

const RESERVED_FIELDS: [&str; 4] = ["type", "action", "timestamp", "serverId"];

impl SyncFrame {
    pub fn new(
        kind: SyncKind,
        entity_id: impl Into<String>,
        action: SyncAction,
        data: Value,
        origin: ServerId,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            action: action.as_str().to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            server_id: origin,
            extra: Map::new(),
        }
    }

    /// The parsed action, or a protocol error for unknown ones.
    pub fn action(&self) -> Result<SyncAction, FederationError> {
        self.action.parse()
    }

    /// Payload for `join` / `leave`: the entity data, or the frame's extra
    /// top-level fields when the sender put the member there.
    pub fn member(&self) -> Value {
        if self.data.is_null() && !self.extra.is_empty() {
            Value::Object(self.extra.clone())
        } else {
            self.data.clone()
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("type".into(), Value::from(self.kind.wire_type()));
        map.insert(self.kind.id_field().into(), Value::from(self.entity_id.clone()));
        map.insert("action".into(), Value::from(self.action.clone()));
        map.insert(self.kind.data_field().into(), self.data.clone());
        map.insert("timestamp".into(), Value::from(self.timestamp));
        map.insert("serverId".into(), Value::from(self.server_id.as_str()));
        Value::Object(map)
    }

    pub(crate) fn from_value(kind: SyncKind, value: Value) -> Result<Self, FederationError> {
        let Value::Object(mut map) = value else {
            return Err(FederationError::Protocol(format!("{kind} frame is not an object")));
        };

        let entity_id = match map.remove(kind.id_field()) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(FederationError::Protocol(format!(
                    "{kind} frame is missing {}",
                    kind.id_field()
                )));
            }
        };
        let action = match map.remove("action") {
            Some(Value::String(s)) => s,
            _ => return Err(FederationError::Protocol(format!("{kind} frame has no action"))),
        };
        let data = map.remove(kind.data_field()).unwrap_or(Value::Null);
        let timestamp = map.get("timestamp").and_then(Value::as_i64).unwrap_or_default();
        let server_id = map
            .get("serverId")
            .and_then(Value::as_str)
            .map(ServerId::from)
            .unwrap_or_default();
        for field in RESERVED_FIELDS {
            map.remove(field);
        }

        Ok(Self {
            kind,
            entity_id,
            action,
            data,
            timestamp,
            server_id,
            extra: map,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_types_resolve() {
        for kind in SyncKind::ALL {
            assert_eq!(SyncKind::from_wire_type(kind.wire_type()), Some(kind));
        }
        assert_eq!(SyncKind::from_wire_type("heartbeat"), None);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("join".parse::<SyncAction>().unwrap(), SyncAction::Join);
        assert!(matches!(
            "explode".parse::<SyncAction>(),
            Err(FederationError::Protocol(_))
        ));
    }

    #[test]
    fn test_group_frame_uses_entity_field_names() {
        let frame = SyncFrame::new(
            SyncKind::Group,
            "g-42",
            SyncAction::Create,
            json!({"name": "Desk A"}),
            ServerId::from("srv-1"),
        );
        let value = frame.to_value();
        assert_eq!(value["type"], "group_sync");
        assert_eq!(value["groupId"], "g-42");
        assert_eq!(value["groupData"]["name"], "Desk A");
        assert_eq!(value["action"], "create");
        assert_eq!(value["serverId"], "srv-1");
        assert!(value.get("entityId").is_none());
    }

    #[test]
    fn test_decode_audio_route_frame() {
        let raw = json!({
            "type": "audio_route",
            "routeId": "r-1",
            "action": "update",
            "routeData": {"gain": 3},
            "timestamp": 1700000000000i64,
            "serverId": "srv-2"
        });
        let frame = SyncFrame::from_value(SyncKind::AudioRoute, raw).unwrap();
        assert_eq!(frame.entity_id, "r-1");
        assert_eq!(frame.action().unwrap(), SyncAction::Update);
        assert_eq!(frame.data["gain"], 3);
        assert_eq!(frame.timestamp, 1_700_000_000_000);
        assert_eq!(frame.server_id.as_str(), "srv-2");
        assert!(frame.extra.is_empty());
    }

    #[test]
    fn test_missing_entity_id_is_protocol_error() {
        let raw = json!({"type": "recording_sync", "action": "create"});
        let err = SyncFrame::from_value(SyncKind::Recording, raw).unwrap_err();
        assert!(matches!(err, FederationError::Protocol(_)));
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let raw = json!({"type": "matrix_sync", "roomId": "!a:hs", "action": "archive"});
        let frame = SyncFrame::from_value(SyncKind::MatrixRoom, raw).unwrap();
        assert_eq!(frame.action, "archive");
        assert!(frame.action().is_err());
    }

    #[test]
    fn test_member_falls_back_to_extra_fields() {
        let raw = json!({
            "type": "group_sync",
            "groupId": "g-1",
            "action": "join",
            "userId": "u-7",
            "userData": {"role": "trader"},
            "serverId": "srv-2"
        });
        let frame = SyncFrame::from_value(SyncKind::Group, raw).unwrap();
        let member = frame.member();
        assert_eq!(member["userId"], "u-7");
        assert_eq!(member["userData"]["role"], "trader");

        // Extra fields survive re-encoding.
        assert_eq!(frame.to_value()["userId"], "u-7");
    }
}
