//! Federation error types.

use std::time::Duration;

/// Errors that can occur in the intercom_federation crate.
///
/// Deferred delivery is not an error: a send to a disconnected peer is
/// reported through the `false` return of
/// [`FederationNode::send_to_peer`](crate::node::FederationNode::send_to_peer).
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// Bad or expired token, or a server trying to federate with itself.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Dial failure or a link that closed underneath us.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frame or unknown message type.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A WebSocket-level error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A sync handler rejected an update.
    #[error("Subsystem error: {0}")]
    Subsystem(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for FederationError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FederationError::Authentication("token expired".into());
        assert_eq!(err.to_string(), "Authentication error: token expired");

        let err = FederationError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Timeout after 10s");
    }

    #[test]
    fn test_from_serde_error() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: FederationError = bad.into();
        assert!(matches!(err, FederationError::Serialization(_)));
    }
}
