//! Handshake credentials.
//!
//! A dialing server proves who it is with a short-lived token carried in its
//! `auth` frame. How tokens are produced and checked sits behind the
//! [`Credentials`] trait; the default [`SharedSecretCredentials`] signs an
//! HS256 JSON Web Token with the mesh-wide federation secret.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::FederationError;
use crate::identity::{ServerId, ServerIdentity};

/// Allowed clock skew between servers when checking expiry.
const CLOCK_LEEWAY_SECS: u64 = 60;

/// Claims carried by a handshake token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub server_id: ServerId,
    pub server_name: String,
    /// Issue time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Produces and checks handshake tokens.
pub trait Credentials: Send + Sync {
    /// Issue a token asserting `identity`.
    fn issue(&self, identity: &ServerIdentity) -> Result<String, FederationError>;

    /// Check a token's signature and validity window and return its claims.
    fn verify(&self, token: &str) -> Result<TokenClaims, FederationError>;
}

/// Shared-secret HS256 JSON Web Tokens.
pub struct SharedSecretCredentials {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl SharedSecretCredentials {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = CLOCK_LEEWAY_SECS;
        Self {
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
            validation,
            ttl,
        }
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(
        &self,
        identity: &ServerIdentity,
        now: DateTime<Utc>,
    ) -> Result<String, FederationError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            server_id: identity.server_id.clone(),
            server_name: identity.server_name.clone(),
            timestamp: now.timestamp_millis(),
            iat: now.timestamp(),
            exp: now.timestamp().saturating_add(ttl),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| FederationError::Config(format!("cannot sign handshake token: {e}")))
    }
}

impl Credentials for SharedSecretCredentials {
    fn issue(&self, identity: &ServerIdentity) -> Result<String, FederationError> {
        self.issue_at(identity, Utc::now())
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, FederationError> {
        decode::<TokenClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => auth_error("token has expired"),
                ErrorKind::InvalidSignature => auth_error("invalid token signature"),
                _ => auth_error(format!("malformed token: {e}")),
            })
    }
}

/// Acceptor-side check of an `auth` frame: the token must verify and must
/// not name the local server.
pub fn authenticate_peer(
    credentials: &dyn Credentials,
    local: &ServerId,
    token: &str,
) -> Result<TokenClaims, FederationError> {
    let claims = credentials.verify(token)?;
    if claims.server_id == *local {
        return Err(auth_error("Cannot connect to self"));
    }
    if claims.server_id.is_empty() {
        return Err(auth_error("token carries no serverId"));
    }
    Ok(claims)
}

fn auth_error(msg: impl Into<String>) -> FederationError {
    FederationError::Authentication(msg.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
