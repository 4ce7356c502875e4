//! Identity resolution for incoming sockets
//!
//! Sessions are established elsewhere; the coordinator only verifies the
//! token it is handed. Tokens look like `<payload>.<signature>` where the
//! payload is base64url JSON claims and the signature is
//! `hex(sha256(payload ":" secret))`.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RaceError;
use crate::types::UserId;

/// Verified caller identity, one per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "sub")]
    pub user_id: UserId,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(default)]
    pub admin: bool,
}

#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Identity, RaceError>;
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Signing secret (None = signatures are not checked)
    pub secret: Option<String>,
}

impl AuthConfig {
    /// AUTH_SECRET must be set for tokens to be verified
    pub fn from_env() -> Self {
        let secret = std::env::var("AUTH_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if secret.is_some() {
            tracing::info!("Token verification enabled");
        } else {
            tracing::warn!(
                "AUTH_SECRET not set - token signatures are NOT checked, anyone can claim any identity!"
            );
        }
        Self { secret }
    }
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn sign(payload: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Create a token for `identity`. Used by tooling and tests.
pub fn issue_token(identity: &Identity, secret: &str) -> String {
    let claims = serde_json::to_vec(identity).unwrap_or_default();
    let payload = URL_SAFE_NO_PAD.encode(claims);
    let signature = sign(&payload, secret);
    format!("{}.{}", payload, signature)
}

#[derive(Debug, Clone)]
pub struct SignedTokenResolver {
    config: AuthConfig,
}

impl SignedTokenResolver {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, RaceError> {
        let (payload, signature) = token.split_once('.').ok_or(RaceError::Unauthorized)?;

        if let Some(secret) = &self.config.secret {
            let expected = sign(payload, secret);
            if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
                tracing::warn!("Rejected token with bad signature");
                return Err(RaceError::Unauthorized);
            }
        }

        let claims = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| RaceError::Unauthorized)?;
        let identity: Identity =
            serde_json::from_slice(&claims).map_err(|_| RaceError::Unauthorized)?;

        if identity.user_id.trim().is_empty() {
            return Err(RaceError::Unauthorized);
        }
        Ok(identity)
    }
}

#[async_trait]
impl SessionResolver for SignedTokenResolver {
    async fn resolve(&self, token: &str) -> Result<Identity, RaceError> {
        self.verify(token)
    }
}

/// Pick the token from `?token=` or an `Authorization: Bearer` header
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
