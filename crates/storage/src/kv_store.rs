use any2json_domain::storage::{KvStore, Namespace, StorageResult, Versioned};
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::entity::kv_entries::{self, Column};
use crate::errors::StorageError;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl KvStore for SeaOrmStorage {
    async fn get(&self, namespace: Namespace, key: &str) -> StorageResult<Option<Versioned>> {
        let maybe = kv_entries::Entity::find_by_id((namespace.as_ref().to_string(), key.to_string()))
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.map(|model| Versioned {
            value: model.value,
            version: model.version,
        }))
    }

    async fn put(&self, namespace: Namespace, key: &str, value: &str) -> StorageResult<()> {
        kv_entries::Entity::insert(new_entry(namespace, key, value))
            .on_conflict(
                OnConflict::columns([Column::Namespace, Column::Key])
                    .update_columns([Column::Value, Column::UpdatedAt])
                    .value(
                        Column::Version,
                        Expr::col((kv_entries::Entity, Column::Version)).add(1),
                    )
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> StorageResult<bool> {
        let inserted = kv_entries::Entity::insert(new_entry(namespace, key, value))
            .on_conflict(
                OnConflict::columns([Column::Namespace, Column::Key])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(inserted == 1)
    }

    async fn put_if_version(
        &self,
        namespace: Namespace,
        key: &str,
        value: &str,
        expected_version: i64,
    ) -> StorageResult<bool> {
        let result = kv_entries::Entity::update_many()
            .col_expr(Column::Value, Expr::value(value))
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Namespace.eq(namespace.as_ref()))
            .filter(Column::Key.eq(key))
            .filter(Column::Version.eq(expected_version))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected == 1)
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> StorageResult<()> {
        kv_entries::Entity::delete_by_id((namespace.as_ref().to_string(), key.to_string()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}

fn new_entry(namespace: Namespace, key: &str, value: &str) -> kv_entries::ActiveModel {
    kv_entries::ActiveModel {
        namespace: Set(namespace.as_ref().to_string()),
        key: Set(key.to_string()),
        value: Set(value.to_string()),
        version: Set(1),
        updated_at: Set(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> SeaOrmStorage {
        SeaOrmStorage::connect("sqlite::memory:")
            .await
            .expect("sqlite storage")
    }

    #[tokio::test]
    async fn put_overwrites_and_bumps_version() {
        let store = storage().await;
        assert_eq!(store.get(Namespace::Users, "user:1").await.unwrap(), None);

        store.put(Namespace::Users, "user:1", "a").await.unwrap();
        store.put(Namespace::Users, "user:1", "b").await.unwrap();
        let record = store.get(Namespace::Users, "user:1").await.unwrap().unwrap();
        assert_eq!(record.value, "b");
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = storage().await;
        store.put(Namespace::Users, "k", "user").await.unwrap();
        store.put(Namespace::Addresses, "k", "addr").await.unwrap();
        assert_eq!(
            store.get(Namespace::Users, "k").await.unwrap().unwrap().value,
            "user"
        );
        assert_eq!(
            store.get(Namespace::Addresses, "k").await.unwrap().unwrap().value,
            "addr"
        );
    }

    #[tokio::test]
    async fn put_if_absent_only_inserts_once() {
        let store = storage().await;
        assert!(store
            .put_if_absent(Namespace::Users, "email:a@x.com", "u1")
            .await
            .unwrap());
        assert!(!store
            .put_if_absent(Namespace::Users, "email:a@x.com", "u2")
            .await
            .unwrap());
        let record = store
            .get(Namespace::Users, "email:a@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.value, "u1");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn put_if_version_rejects_stale_writers() {
        let store = storage().await;
        store
            .put(Namespace::Addresses, "pool:trc20", "[\"T1\",\"T2\"]")
            .await
            .unwrap();

        assert!(store
            .put_if_version(Namespace::Addresses, "pool:trc20", "[\"T2\"]", 1)
            .await
            .unwrap());
        assert!(!store
            .put_if_version(Namespace::Addresses, "pool:trc20", "[]", 1)
            .await
            .unwrap());
        assert!(!store
            .put_if_version(Namespace::Addresses, "pool:missing", "[]", 1)
            .await
            .unwrap());

        let record = store
            .get(Namespace::Addresses, "pool:trc20")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.value, "[\"T2\"]");
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn delete_removes_the_entry() {
        let store = storage().await;
        store.put(Namespace::Users, "apikey:x", "u1").await.unwrap();
        store.delete(Namespace::Users, "apikey:x").await.unwrap();
        store.delete(Namespace::Users, "apikey:x").await.unwrap();
        assert_eq!(store.get(Namespace::Users, "apikey:x").await.unwrap(), None);
        assert!(store
            .put_if_absent(Namespace::Users, "apikey:x", "u2")
            .await
            .unwrap());
    }
}
