use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{KvStore, Namespace, StorageResult, Versioned};

/// Process-local store with the same conditional-write semantics as the
/// SeaORM adapter. Used by unit tests and single-process tooling.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKvStore {
    entries: Arc<Mutex<HashMap<(Namespace, String), Versioned>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, namespace: Namespace, key: &str) -> StorageResult<Option<Versioned>> {
        let guard = self.entries.lock().expect("mutex poisoned");
        Ok(guard.get(&(namespace, key.to_string())).cloned())
    }

    async fn put(&self, namespace: Namespace, key: &str, value: &str) -> StorageResult<()> {
        let mut guard = self.entries.lock().expect("mutex poisoned");
        let entry = guard
            .entry((namespace, key.to_string()))
            .or_insert_with(|| Versioned {
                value: String::new(),
                version: 0,
            });
        entry.value = value.to_string();
        entry.version += 1;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        namespace: Namespace,
        key: &str,
        value: &str,
    ) -> StorageResult<bool> {
        let mut guard = self.entries.lock().expect("mutex poisoned");
        let slot = (namespace, key.to_string());
        if guard.contains_key(&slot) {
            return Ok(false);
        }
        guard.insert(
            slot,
            Versioned {
                value: value.to_string(),
                version: 1,
            },
        );
        Ok(true)
    }

    async fn put_if_version(
        &self,
        namespace: Namespace,
        key: &str,
        value: &str,
        expected_version: i64,
    ) -> StorageResult<bool> {
        let mut guard = self.entries.lock().expect("mutex poisoned");
        match guard.get_mut(&(namespace, key.to_string())) {
            Some(entry) if entry.version == expected_version => {
                entry.value = value.to_string();
                entry.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> StorageResult<()> {
        let mut guard = self.entries.lock().expect("mutex poisoned");
        guard.remove(&(namespace, key.to_string()));
        Ok(())
    }
}
