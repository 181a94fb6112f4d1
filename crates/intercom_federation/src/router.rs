//! Message router: hands inbound sync frames to the local subsystem that
//! owns the entity.
//!
//! Handshake and heartbeat frames never reach the router; the node handles
//! them. Every failure here is contained to the one frame: an unknown action
//! or a subsystem error is logged and the link keeps going.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FederationError;
use crate::sync::{SyncAction, SyncFrame, SyncKind};

/// A local service that owns one kind of replicated entity.
#[async_trait]
pub trait SyncSubsystem: Send + Sync {
    async fn create(&self, id: &str, data: &Value) -> anyhow::Result<()>;

    async fn update(&self, id: &str, data: &Value) -> anyhow::Result<()>;

    async fn delete(&self, id: &str) -> anyhow::Result<()>;

    async fn join(&self, id: &str, _member: &Value) -> anyhow::Result<()> {
        anyhow::bail!("join is not supported (entity {id})")
    }

    async fn leave(&self, id: &str, _member: &Value) -> anyhow::Result<()> {
        anyhow::bail!("leave is not supported (entity {id})")
    }
}

/// Subsystem that only logs what it is asked to do. Used for every kind the
/// host process does not wire up.
#[derive(Debug, Clone, Copy)]
pub struct LoggingSubsystem {
    domain: &'static str,
}

impl LoggingSubsystem {
    pub fn new(domain: &'static str) -> Self {
        Self { domain }
    }
}

#[async_trait]
impl SyncSubsystem for LoggingSubsystem {
    async fn create(&self, id: &str, _data: &Value) -> anyhow::Result<()> {
        info!("Federated {} created: {id}", self.domain);
        Ok(())
    }

    async fn update(&self, id: &str, _data: &Value) -> anyhow::Result<()> {
        info!("Federated {} updated: {id}", self.domain);
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        info!("Federated {} deleted: {id}", self.domain);
        Ok(())
    }

    async fn join(&self, id: &str, member: &Value) -> anyhow::Result<()> {
        info!("Federated {} {id}: member joined {member}", self.domain);
        Ok(())
    }

    async fn leave(&self, id: &str, member: &Value) -> anyhow::Result<()> {
        info!("Federated {} {id}: member left {member}", self.domain);
        Ok(())
    }
}

/// One subsystem per sync kind.
#[derive(Clone)]
pub struct Subsystems {
    pub groups: Arc<dyn SyncSubsystem>,
    pub users: Arc<dyn SyncSubsystem>,
    pub audio_routes: Arc<dyn SyncSubsystem>,
    pub recordings: Arc<dyn SyncSubsystem>,
    pub rooms: Arc<dyn SyncSubsystem>,
}

impl Default for Subsystems {
    fn default() -> Self {
        Self {
            groups: Arc::new(LoggingSubsystem::new("group")),
            users: Arc::new(LoggingSubsystem::new("user")),
            audio_routes: Arc::new(LoggingSubsystem::new("audio route")),
            recordings: Arc::new(LoggingSubsystem::new("recording")),
            rooms: Arc::new(LoggingSubsystem::new("room")),
        }
    }
}

impl Subsystems {
    pub fn with_groups(mut self, groups: Arc<dyn SyncSubsystem>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_users(mut self, users: Arc<dyn SyncSubsystem>) -> Self {
        self.users = users;
        self
    }

    pub fn with_audio_routes(mut self, audio_routes: Arc<dyn SyncSubsystem>) -> Self {
        self.audio_routes = audio_routes;
        self
    }

    pub fn with_recordings(mut self, recordings: Arc<dyn SyncSubsystem>) -> Self {
        self.recordings = recordings;
        self
    }

    pub fn with_rooms(mut self, rooms: Arc<dyn SyncSubsystem>) -> Self {
        self.rooms = rooms;
        self
    }

    /// The subsystem that owns entities of `kind`.
    pub fn for_kind(&self, kind: SyncKind) -> &Arc<dyn SyncSubsystem> {
        match kind {
            SyncKind::Group => &self.groups,
            SyncKind::User => &self.users,
            SyncKind::AudioRoute => &self.audio_routes,
            SyncKind::Recording => &self.recordings,
            SyncKind::MatrixRoom => &self.rooms,
        }
    }
}

impl std::fmt::Debug for Subsystems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystems").finish_non_exhaustive()
    }
}

/// Routes inbound sync frames to [`Subsystems`].
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    subsystems: Subsystems,
}

impl MessageRouter {
    pub fn new(subsystems: Subsystems) -> Self {
        Self { subsystems }
    }

    /// Apply a frame, logging and dropping any failure.
    pub async fn dispatch(&self, frame: &SyncFrame) {
        if let Err(e) = self.route(frame).await {
            warn!(
                "Dropped {} from {} ({} {}): {e}",
                frame.kind, frame.server_id, frame.action, frame.entity_id
            );
        }
    }

    /// Apply a frame and report the outcome.
    pub async fn route(&self, frame: &SyncFrame) -> Result<SyncAction, FederationError> {
        let action = frame.action()?;
        let subsystem = self.subsystems.for_kind(frame.kind);
        let id = frame.entity_id.as_str();
        debug!(
            "Applying {} {action} {id} from {}",
            frame.kind, frame.server_id
        );

        let outcome = match action {
            SyncAction::Create => subsystem.create(id, &frame.data).await,
            SyncAction::Update => subsystem.update(id, &frame.data).await,
            SyncAction::Delete => subsystem.delete(id).await,
            SyncAction::Join => subsystem.join(id, &frame.member()).await,
            SyncAction::Leave => subsystem.leave(id, &frame.member()).await,
        };
        outcome.map_err(|e| FederationError::Subsystem(format!("{e:#}")))?;
        Ok(action)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServerId;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records every call it receives.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_updates: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SyncSubsystem for Recorder {
        async fn create(&self, id: &str, data: &Value) -> anyhow::Result<()> {
            self.calls.lock().push(format!("create {id} {data}"));
            Ok(())
        }

        async fn update(&self, id: &str, _data: &Value) -> anyhow::Result<()> {
            if self.fail_updates {
                anyhow::bail!("store unavailable");
            }
            self.calls.lock().push(format!("update {id}"));
            Ok(())
        }

        async fn delete(&self, id: &str) -> anyhow::Result<()> {
            self.calls.lock().push(format!("delete {id}"));
            Ok(())
        }

        async fn join(&self, id: &str, member: &Value) -> anyhow::Result<()> {
            self.calls.lock().push(format!("join {id} {member}"));
            Ok(())
        }
    }

    fn frame(kind: SyncKind, action: &str, data: Value) -> SyncFrame {
        let mut frame = SyncFrame::new(kind, "e-1", SyncAction::Create, data, ServerId::from("srv-2"));
        frame.action = action.to_string();
        frame
    }

    #[tokio::test]
    async fn test_routes_by_kind() {
        let groups = Arc::new(Recorder::default());
        let rooms = Arc::new(Recorder::default());
        let router = MessageRouter::new(
            Subsystems::default()
                .with_groups(groups.clone())
                .with_rooms(rooms.clone()),
        );

        let action = router
            .route(&frame(SyncKind::Group, "create", json!({"name": "Desk"})))
            .await
            .unwrap();
        assert_eq!(action, SyncAction::Create);
        router
            .route(&frame(SyncKind::MatrixRoom, "delete", Value::Null))
            .await
            .unwrap();

        assert_eq!(groups.calls(), vec![r#"create e-1 {"name":"Desk"}"#]);
        assert_eq!(rooms.calls(), vec!["delete e-1"]);
    }

    #[tokio::test]
    async fn test_unknown_action_is_protocol_error() {
        let groups = Arc::new(Recorder::default());
        let router = MessageRouter::new(Subsystems::default().with_groups(groups.clone()));

        let err = router
            .route(&frame(SyncKind::Group, "archive", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Protocol(_)));
        assert!(groups.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subsystem_error_is_contained() {
        let users = Arc::new(Recorder {
            fail_updates: true,
            ..Default::default()
        });
        let router = MessageRouter::new(Subsystems::default().with_users(users.clone()));

        let err = router
            .route(&frame(SyncKind::User, "update", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("store unavailable"));

        // dispatch swallows the error and later frames still apply
        router.dispatch(&frame(SyncKind::User, "update", json!({}))).await;
        router.dispatch(&frame(SyncKind::User, "delete", Value::Null)).await;
        assert_eq!(users.calls(), vec!["delete e-1"]);
    }

    #[tokio::test]
    async fn test_join_uses_extra_fields_as_member() {
        let groups = Arc::new(Recorder::default());
        let router = MessageRouter::new(Subsystems::default().with_groups(groups.clone()));

        let mut join = frame(SyncKind::Group, "join", Value::Null);
        join.extra.insert("userId".into(), json!("u-7"));
        router.route(&join).await.unwrap();

        assert_eq!(groups.calls(), vec![r#"join e-1 {"userId":"u-7"}"#]);
    }

    #[tokio::test]
    async fn test_leave_unsupported_by_default() {
        let groups = Arc::new(Recorder::default());
        let router = MessageRouter::new(Subsystems::default().with_groups(groups));

        let err = router
            .route(&frame(SyncKind::Group, "leave", json!({"userId": "u-7"})))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Subsystem(_)));
    }

    #[tokio::test]
    async fn test_logging_subsystems_accept_everything() {
        let router = MessageRouter::default();
        for kind in SyncKind::ALL {
            for action in ["create", "update", "delete", "join", "leave"] {
                router.route(&frame(kind, action, json!({}))).await.unwrap();
            }
        }
    }
}
