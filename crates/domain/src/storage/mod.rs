//! Key-value store contract shared by the services and the SeaORM adapter.
//!
//! The store offers no multi-key transactions. Every mutation that spans a
//! read and a write goes through one of the single-key conditional writes
//! (`put_if_absent`, `put_if_version`) so concurrent writers detect each other
//! instead of silently overwriting.

mod memory;

use async_trait::async_trait;
use strum_macros::AsRefStr;
use thiserror::Error;

use crate::model::{ApiKey, Email, Network, UserId};

pub use memory::InMemoryKvStore;

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt record `{key}`: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Logical namespaces of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Namespace {
    Users,
    Addresses,
}

/// A stored value together with the version it was read at. Versions start at
/// 1 and increase by one on every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: i64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: Namespace, key: &str) -> StorageResult<Option<Versioned>>;

    /// Unconditional upsert.
    async fn put(&self, namespace: Namespace, key: &str, value: &str) -> StorageResult<()>;

    /// Inserts only when the key does not exist yet. Returns `false` when
    /// another writer got there first.
    async fn put_if_absent(
        &self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> StorageResult<bool>;

    /// Replaces the value only while the stored version still equals
    /// `expected_version`. Returns `false` on a version mismatch or a missing key.
    async fn put_if_version(
        &self,
        namespace: Namespace,
        key: &str,
        value: &str,
        expected_version: i64,
    ) -> StorageResult<bool>;

    async fn delete(&self, namespace: Namespace, key: &str) -> StorageResult<()>;
}

pub fn user_key(id: &UserId) -> String {
    format!("user:{}", id.as_str())
}

pub fn email_key(email: &Email) -> String {
    format!("email:{}", email.as_str())
}

pub fn api_key_key(api_key: &ApiKey) -> String {
    format!("apikey:{}", api_key.as_str())
}

pub fn pool_key(network: Network) -> String {
    format!("pool:{}", network.as_ref())
}

pub fn user_address_key(id: &UserId, network: Network) -> String {
    format!("useraddr:{}:{}", id.as_str(), network.as_ref())
}

pub fn address_key(address: &str) -> String {
    format!("addr:{address}")
}
