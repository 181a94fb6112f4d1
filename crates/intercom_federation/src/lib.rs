//! Intercom Federation: server-to-server mesh for the voice intercom.
//!
//! This crate links independently deployed intercom servers so that groups,
//! users, audio routes, recordings and chat rooms stay in step across sites.
//! It authenticates peer servers, keeps their links alive, redials links
//! that drop, queues messages for offline peers and hands inbound sync
//! intents to the local subsystems that own them.
//!
//! # Architecture
//!
//! - **Transport**: WebSocket links (via `tokio-tungstenite`) on the
//!   `/federation` path, one supervising task per link.
//! - **Handshake**: short-lived HS256 tokens signed with a shared federation
//!   secret, behind the pluggable [`Credentials`] trait.
//! - **Protocol**: JSON frames decoded once into [`FederationMessage`].
//! - **Routing**: sync frames dispatched to [`SyncSubsystem`]s; failures are
//!   contained to the frame.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use intercom_federation::{FederationConfig, FederationNode, Subsystems, SyncAction};
//!
//! # async fn example() -> Result<(), intercom_federation::FederationError> {
//! let mut config = FederationConfig::default();
//! config.federation_secret = "change-me".into();
//! let mut node = FederationNode::new(config, Subsystems::default());
//!
//! node.start().await?;
//! node.sync_group("desk-7", SyncAction::Update, serde_json::json!({"name": "FX Desk"}));
//! node.stop();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod peer;
pub mod reconnect;
pub mod router;
pub mod sync;
pub mod timer;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use auth::{Credentials, SharedSecretCredentials, TokenClaims};
pub use config::{FederationConfig, PeerConfig};
pub use error::FederationError;
pub use identity::{Capabilities, ServerId, ServerIdentity};
pub use message::{AuthRequest, AuthResponse, AuthStatus, FederationMessage, Heartbeat};
pub use node::{
    DeliveryReport, FederationExport, FederationNode, FederationStats, FederationStatus,
    ImportSummary,
};
pub use peer::{ConnectionStatus, PeerRecord, PeerRegistry};
pub use router::{LoggingSubsystem, MessageRouter, Subsystems, SyncSubsystem};
pub use sync::{SyncAction, SyncFrame, SyncKind};
