//! Handshake authentication.
//!
//! Credential issuance lives elsewhere; the relay only turns a presented
//! bearer token into a verified [`Identity`].

use crate::config::TokenEntry;
use crate::error::AuthError;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::collections::HashMap;
use tether_types::Identity;

/// Resolves a bearer credential to an identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token`. Any error is a hard reject.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier over the `[[auth.tokens]]` config table.
#[derive(Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl std::fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenVerifier")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl StaticTokenVerifier {
    /// Build from config entries, skipping entries whose identity is invalid.
    pub fn from_config(entries: &[TokenEntry]) -> Self {
        let mut tokens = HashMap::with_capacity(entries.len());
        for entry in entries {
            let identity = Identity {
                user_id: entry.user_id.clone(),
                kind: entry.kind,
                device_id: entry.device_id.clone(),
            };
            if let Err(e) = identity.validate() {
                tracing::warn!(user_id = %entry.user_id, "Skipping token entry: {}", e);
                continue;
            }
            tokens.insert(entry.token.clone(), identity);
        }
        Self { tokens }
    }

    /// Number of accepted tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when no token is accepted.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}

/// Pull the bearer credential from the `Authorization` header, falling back to
/// a `token` query parameter for clients that cannot set headers on upgrade.
pub fn extract_bearer(headers: &HeaderMap, query_token: Option<&str>) -> Result<String, AuthError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::InvalidCredential)?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .ok_or(AuthError::InvalidCredential)?;
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        return Ok(token.to_string());
    }

    match query_token.map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AuthError::MissingCredential),
    }
}
