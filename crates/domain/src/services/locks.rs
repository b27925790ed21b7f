use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async mutexes used to serialize read-modify-write sequences on one
/// logical record (an e-mail claim, a pool, a user's usage counter).
///
/// Entries idle out of the table; a guard keeps its mutex alive while held.
/// Exclusion only spans this process, so callers still commit through the
/// store's conditional writes.
#[derive(Clone)]
pub struct KeyedLocks {
    slots: Cache<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub const DEFAULT_IDLE: Duration = Duration::from_secs(600);
    pub const DEFAULT_CAPACITY: u64 = 100_000;

    pub fn new(idle: Duration, capacity: u64) -> Self {
        Self {
            slots: Cache::builder()
                .time_to_idle(idle)
                .max_capacity(capacity.max(1))
                .build(),
        }
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = self
            .slots
            .get_with(key.to_string(), || Arc::new(Mutex::new(())));
        slot.lock_owned().await
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_IDLE, Self::DEFAULT_CAPACITY)
    }
}
