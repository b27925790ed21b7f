use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha3::Sha3_256;
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;
use crate::model::UserId;

type TokenMac = Hmac<Sha3_256>;

/// Longest token lifetime a signer accepts.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("token lifetime out of range")]
    InvalidTtl,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    /// Expiry as unix milliseconds.
    exp: i64,
}

/// Issues and verifies stateless bearer tokens.
///
/// Format: `base64url(claims_json) "." base64url(hmac_sha3_256(secret, first_part))`.
/// Nothing is persisted; a token is valid while its signature checks out and
/// its expiry lies in the future.
#[derive(Clone)]
pub struct TokenSigner {
    mac: TokenMac,
    ttl: chrono::Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, TokenError> {
        let mac =
            TokenMac::new_from_slice(secret).map_err(|err| TokenError::InvalidKey(err.to_string()))?;
        if ttl.is_zero() || ttl > MAX_TOKEN_TTL {
            return Err(TokenError::InvalidTtl);
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| TokenError::InvalidTtl)?;
        Ok(Self { mac, ttl })
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, TokenError> {
        Self::new(config.token_secret(), config.token_ttl())
    }

    pub fn issue(&self, subject: &UserId) -> String {
        self.issue_at(subject, Utc::now())
    }

    pub fn issue_at(&self, subject: &UserId, now: DateTime<Utc>) -> String {
        let expiry = now + self.ttl;
        let claims = serde_json::json!({
            "sub": subject.as_str(),
            "exp": expiry.timestamp_millis(),
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        format!("{payload}.{signature}")
    }

    /// Returns the subject, or `None` for anything that is not a live token
    /// issued with this key.
    pub fn verify(&self, token: &str) -> Option<UserId> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Option<UserId> {
        let (payload, signature) = token.trim().split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!("token signature mismatch");
            return None;
        }

        let raw = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let claims: Claims = serde_json::from_slice(&raw).ok()?;
        if claims.exp < now.timestamp_millis() {
            debug!(subject = claims.sub, "token expired");
            return None;
        }
        if claims.sub.is_empty() {
            return None;
        }
        Some(UserId::new(claims.sub))
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
