//! Data structures shared by the API, storage and provider crates.

use std::fmt;

use chrono::{DateTime, Utc};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Prefix carried by every issued API key.
pub const API_KEY_PREFIX: &str = "a2j_";

/// Random bytes behind an API key (rendered as hex after the prefix).
pub const API_KEY_BYTES: usize = 24;

/// Tier assigned to freshly registered accounts.
pub const DEFAULT_TIER: &str = "free";

/// Errors emitted when user-supplied identifiers fail validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("email is required")]
    MissingEmail,
    #[error("email `{0}` is not a valid address")]
    MalformedEmail(String),
    #[error("password is required")]
    MissingPassword,
    #[error("invalid network `{0}`; supported: trc20, erc20, dai, xdai")]
    UnknownNetwork(String),
    #[error("random source unavailable: {0}")]
    Entropy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical (trimmed, lowercased) e-mail address used as the uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::MissingEmail);
        }
        let malformed = || ModelError::MalformedEmail(trimmed.to_string());
        let (local, domain) = trimmed.split_once('@').ok_or_else(malformed)?;
        if local.is_empty()
            || domain.len() < 3
            || domain.contains('@')
            || !domain.contains('.')
            || domain.starts_with('.')
            || domain.ends_with('.')
            || trimmed.chars().any(char::is_whitespace)
        {
            return Err(malformed());
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Draws a fresh key from the OS random source.
    pub fn generate() -> Result<Self, ModelError> {
        let mut bytes = [0u8; API_KEY_BYTES];
        getrandom::fill(&mut bytes).map_err(|err| ModelError::Entropy(err.to_string()))?;
        Ok(Self(format!("{API_KEY_PREFIX}{}", hex_encode(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Persisted account record. Field names follow the stored JSON layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub email: Email,
    pub password_hash: String,
    pub api_key: ApiKey,
    pub balance: f64,
    pub used: f64,
    pub tier: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Base32 TOTP secret once the user started two-factor enrollment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    /// Set after the user proved possession of the secret.
    #[serde(default)]
    pub totp_enabled: bool,
}

impl User {
    pub fn new(id: UserId, email: Email, password_hash: String, api_key: ApiKey) -> Self {
        Self {
            id,
            email,
            password_hash,
            api_key,
            balance: 0.0,
            used: 0.0,
            tier: DEFAULT_TIER.to_string(),
            created_at: Utc::now(),
            totp_secret: None,
            totp_enabled: false,
        }
    }
}

/// Payment networks with a provisioned address pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    Trc20,
    Erc20,
    Dai,
    Xdai,
}

impl Network {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        raw.trim()
            .parse()
            .map_err(|_| ModelError::UnknownNetwork(raw.trim().to_string()))
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Network::Trc20 => "USDT (TRC-20)",
            Network::Erc20 => "USDT (ERC-20)",
            Network::Dai => "DAI (Ethereum)",
            Network::Xdai => "xDAI (Gnosis)",
        }
    }
}

/// Committed (user, network) → address binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAssignment {
    pub address: String,
    pub network: Network,
}

impl AddressAssignment {
    pub fn network_name(&self) -> &'static str {
        self.network.display_name()
    }
}

/// Token counters reported by the extraction provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-token rates charged by the provider, before margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_rate: f64,
    pub output_rate: f64,
}
