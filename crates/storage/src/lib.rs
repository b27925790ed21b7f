//! SeaORM-backed implementation of the domain `KvStore` contract. SQLite is
//! the default backend; PostgreSQL is available behind the `postgres` feature.

mod builder;
mod entity;
mod errors;
mod kv_store;
mod migration;

use std::sync::Arc;

use any2json_domain::storage::StorageResult;
pub use builder::StorageBuilder;
use migration::run_migrations;
use sea_orm::DatabaseConnection;

/// Shared storage handle used by the HTTP API and the provisioning tool.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::builder().database_url(database_url).build().await
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub(crate) fn from_connection(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

pub(crate) async fn prepare_connection(db: &DatabaseConnection) -> StorageResult<()> {
    run_migrations(db).await
}
