//! Environment-driven configuration structures shared by all binaries.

use std::{env, time::Duration};

use thiserror::Error;

use crate::model::Pricing;
use crate::services::MAX_TOKEN_TTL;

/// Minimum accepted length of the token signing secret, in bytes.
pub const MIN_TOKEN_SECRET_LEN: usize = 32;

pub const DEFAULT_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_INPUT_RATE: f64 = 0.000_002_5;
pub const DEFAULT_OUTPUT_RATE: f64 = 0.000_01;
pub const DEFAULT_MARGIN: f64 = 1.5;
pub const DEFAULT_PROVIDER_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// API binary configuration: listeners, shared database and the immutable
/// auth/billing/provider settings loaded once at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    database_url: String,
    api_bind_address: String,
    api_unix_socket: Option<String>,
    internal_bind_address: Option<String>,
    internal_unix_socket: Option<String>,
    auth: AuthConfig,
    billing: BillingConfig,
    provider: ProviderConfig,
}

impl ApiConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            api_bind_address: get_required_var("API_BIND_ADDRESS")?,
            api_unix_socket: get_optional_var("API_UNIX_SOCKET"),
            internal_bind_address: get_optional_var("API_INTERNAL_BIND_ADDRESS"),
            internal_unix_socket: get_optional_var("API_INTERNAL_UNIX_SOCKET"),
            auth: AuthConfig::load_from_env()?,
            billing: BillingConfig::load_from_env()?,
            provider: ProviderConfig::load_from_env()?,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn api_unix_socket(&self) -> Option<&str> {
        self.api_unix_socket.as_deref()
    }

    pub fn internal_bind_address(&self) -> Option<&str> {
        self.internal_bind_address.as_deref()
    }

    pub fn internal_unix_socket(&self) -> Option<&str> {
        self.internal_unix_socket.as_deref()
    }

    pub fn has_internal_listener(&self) -> bool {
        self.internal_bind_address.is_some() || self.internal_unix_socket.is_some()
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn billing(&self) -> &BillingConfig {
        &self.billing
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }
}

/// Token signing settings.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    token_secret: String,
    token_ttl: Duration,
}

impl AuthConfig {
    pub fn new(token_secret: impl Into<String>, token_ttl: Duration) -> Result<Self, ConfigError> {
        let token_secret = token_secret.into();
        if token_secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ConfigError::InvalidValue {
                key: "AUTH_TOKEN_SECRET",
                reason: format!("must be at least {MIN_TOKEN_SECRET_LEN} bytes"),
            });
        }
        if token_ttl.is_zero() || token_ttl > MAX_TOKEN_TTL {
            return Err(ConfigError::InvalidValue {
                key: "AUTH_TOKEN_TTL_SECS",
                reason: format!("must be between 1 and {} seconds", MAX_TOKEN_TTL.as_secs()),
            });
        }
        Ok(Self {
            token_secret,
            token_ttl,
        })
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        let ttl = get_u64_or("AUTH_TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?;
        Self::new(
            get_required_var("AUTH_TOKEN_SECRET")?,
            Duration::from_secs(ttl),
        )
    }

    pub fn token_secret(&self) -> &[u8] {
        self.token_secret.as_bytes()
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

/// Pricing table and margin applied to every billable provider call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillingConfig {
    pricing: Pricing,
    margin: f64,
}

impl BillingConfig {
    pub fn new(pricing: Pricing, margin: f64) -> Result<Self, ConfigError> {
        for (key, value) in [
            ("BILLING_INPUT_RATE", pricing.input_rate),
            ("BILLING_OUTPUT_RATE", pricing.output_rate),
            ("BILLING_MARGIN", margin),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be a finite, non-negative number".into(),
                });
            }
        }
        Ok(Self { pricing, margin })
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        let pricing = Pricing {
            input_rate: get_f64_or("BILLING_INPUT_RATE", DEFAULT_INPUT_RATE)?,
            output_rate: get_f64_or("BILLING_OUTPUT_RATE", DEFAULT_OUTPUT_RATE)?,
        };
        Self::new(pricing, get_f64_or("BILLING_MARGIN", DEFAULT_MARGIN)?)
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            pricing: Pricing {
                input_rate: DEFAULT_INPUT_RATE,
                output_rate: DEFAULT_OUTPUT_RATE,
            },
            margin: DEFAULT_MARGIN,
        }
    }
}

/// Extraction provider endpoint settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    api_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl ProviderConfig {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key,
            model: model.into(),
            timeout,
        }
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        let timeout = get_u64_or("PROVIDER_TIMEOUT_SECS", DEFAULT_PROVIDER_TIMEOUT_SECS)?;
        if timeout == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROVIDER_TIMEOUT_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Self::new(
            get_optional_var("PROVIDER_API_URL").unwrap_or_else(|| DEFAULT_PROVIDER_URL.into()),
            get_optional_var("PROVIDER_API_KEY"),
            get_optional_var("PROVIDER_MODEL").unwrap_or_else(|| DEFAULT_PROVIDER_MODEL.into()),
            Duration::from_secs(timeout),
        ))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Configuration for store-only tooling such as the pool provisioning binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    database_url: String,
}

impl StoreConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(ConfigError::MissingVar { key })
            } else {
                Ok(trimmed.to_string())
            }
        }
        Err(_) => Err(ConfigError::MissingVar { key }),
    }
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn get_u64_or(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

fn get_f64_or(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidFloat { key, source }),
        None => Ok(default),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("ANY2JSON_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid number in `{key}`: {source}")]
    InvalidFloat {
        key: &'static str,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("invalid value in `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn set_env() {
        env::set_var("ANY2JSON_SKIP_DOTENV", "1");
        env::set_var("DATABASE_URL", "sqlite://test.db");
        env::set_var("API_BIND_ADDRESS", "127.0.0.1:8080");
        env::set_var("AUTH_TOKEN_SECRET", SECRET);
        for key in [
            "API_UNIX_SOCKET",
            "API_INTERNAL_BIND_ADDRESS",
            "API_INTERNAL_UNIX_SOCKET",
            "AUTH_TOKEN_TTL_SECS",
            "BILLING_INPUT_RATE",
            "BILLING_OUTPUT_RATE",
            "BILLING_MARGIN",
            "PROVIDER_API_URL",
            "PROVIDER_API_KEY",
            "PROVIDER_MODEL",
            "PROVIDER_TIMEOUT_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn api_config_applies_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();

        let config = ApiConfig::load_from_env().expect("config loads");
        assert_eq!(config.database_url(), "sqlite://test.db");
        assert_eq!(config.api_bind_address(), "127.0.0.1:8080");
        assert!(!config.has_internal_listener());
        assert_eq!(
            config.auth().token_ttl(),
            Duration::from_secs(DEFAULT_TOKEN_TTL_SECS)
        );
        assert_eq!(config.billing().margin(), DEFAULT_MARGIN);
        assert_eq!(config.provider().model(), DEFAULT_PROVIDER_MODEL);
        assert_eq!(config.provider().api_key(), None);
    }

    #[test]
    fn api_config_supports_unix_and_internal_listeners() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("API_UNIX_SOCKET", "/tmp/api.sock");
        env::set_var("API_INTERNAL_BIND_ADDRESS", "127.0.0.1:9090");
        env::set_var("API_INTERNAL_UNIX_SOCKET", "/tmp/api-internal.sock");

        let config = ApiConfig::load_from_env().expect("config loads");
        assert_eq!(config.api_unix_socket(), Some("/tmp/api.sock"));
        assert_eq!(config.internal_bind_address(), Some("127.0.0.1:9090"));
        assert_eq!(
            config.internal_unix_socket(),
            Some("/tmp/api-internal.sock")
        );
        assert!(config.has_internal_listener());

        set_env();
    }

    #[test]
    fn billing_and_provider_overrides_are_parsed() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("BILLING_INPUT_RATE", "0.001");
        env::set_var("BILLING_OUTPUT_RATE", " 0.002 ");
        env::set_var("BILLING_MARGIN", "2");
        env::set_var("PROVIDER_MODEL", "vision-large");
        env::set_var("PROVIDER_API_KEY", "sk-test");
        env::set_var("PROVIDER_TIMEOUT_SECS", "5");

        let config = ApiConfig::load_from_env().expect("config loads");
        assert_eq!(config.billing().pricing().input_rate, 0.001);
        assert_eq!(config.billing().pricing().output_rate, 0.002);
        assert_eq!(config.billing().margin(), 2.0);
        assert_eq!(config.provider().model(), "vision-large");
        assert_eq!(config.provider().api_key(), Some("sk-test"));
        assert_eq!(config.provider().timeout(), Duration::from_secs(5));

        set_env();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();

        env::set_var("BILLING_MARGIN", "lots");
        assert!(matches!(
            ApiConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidFloat {
                key: "BILLING_MARGIN",
                ..
            }
        ));
        env::set_var("BILLING_MARGIN", "-1");
        assert!(matches!(
            ApiConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidValue {
                key: "BILLING_MARGIN",
                ..
            }
        ));
        env::remove_var("BILLING_MARGIN");

        env::set_var("AUTH_TOKEN_SECRET", "short");
        assert!(matches!(
            ApiConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidValue {
                key: "AUTH_TOKEN_SECRET",
                ..
            }
        ));

        set_env();
    }

    #[test]
    fn empty_required_env_var_is_treated_as_missing() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::set_var("DATABASE_URL", "   ");

        let err = ApiConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                key: "DATABASE_URL"
            }
        ));

        set_env();
    }

    #[test]
    fn store_config_only_requires_database_url() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        env::remove_var("API_BIND_ADDRESS");
        env::remove_var("AUTH_TOKEN_SECRET");
        env::set_var("DATABASE_URL", " sqlite://pool.db ");

        let config = StoreConfig::load_from_env().expect("config loads");
        assert_eq!(config.database_url(), "sqlite://pool.db");

        set_env();
    }

    #[test]
    fn token_ttl_must_be_positive_and_bounded() {
        for secs in [0, MAX_TOKEN_TTL.as_secs() + 1, 1_000_000_000_000_000] {
            let err = AuthConfig::new(SECRET, Duration::from_secs(secs)).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue {
                    key: "AUTH_TOKEN_TTL_SECS",
                    ..
                }
            ));
        }
        assert!(AuthConfig::new(SECRET, Duration::from_secs(60)).is_ok());
    }
}
