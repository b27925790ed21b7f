use std::collections::HashSet;

use metrics::{counter, gauge};
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::model::{AddressAssignment, Network, UserId};
use crate::storage::{
    address_key, pool_key, user_address_key, KvStore, Namespace, StorageError, Versioned,
};

use super::locks::KeyedLocks;
use super::MAX_WRITE_ATTEMPTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub network: Network,
    pub added: usize,
    pub skipped: usize,
    pub remaining: usize,
}

/// Hands out payment addresses from the per-network pools, at most one per
/// (user, network) and each address to at most one user.
#[derive(Clone)]
pub struct AddressAllocator<S> {
    store: S,
    locks: KeyedLocks,
}

impl<S: KvStore> AddressAllocator<S> {
    pub fn new(store: S, locks: KeyedLocks) -> Self {
        Self { store, locks }
    }

    pub async fn get_or_assign_address(
        &self,
        user_id: &UserId,
        network: &str,
    ) -> Result<AddressAssignment, ServiceError> {
        let network = Network::parse(network)?;
        let forward = user_address_key(user_id, network);

        if let Some(existing) = self.existing(&forward, network).await? {
            return Ok(existing);
        }

        let pool = pool_key(network);
        let _guard = self.locks.lock(&pool).await;
        // Another request for the same pair may have committed while we waited.
        if let Some(existing) = self.existing(&forward, network).await? {
            return Ok(existing);
        }

        let mut conflicts = 0;
        loop {
            let Some(current) = self.store.get(Namespace::Addresses, &pool).await? else {
                return Err(pool_unavailable(network));
            };
            let mut addresses = decode_pool(&pool, &current)?;
            if addresses.is_empty() {
                return Err(pool_unavailable(network));
            }

            let address = addresses.remove(0);
            let shortened = encode_pool(&addresses)?;
            if !self
                .store
                .put_if_version(Namespace::Addresses, &pool, &shortened, current.version)
                .await?
            {
                conflicts += 1;
                counter!("store_conflicts_total", "record" => "pool").increment(1);
                if conflicts >= MAX_WRITE_ATTEMPTS {
                    return Err(ServiceError::Internal(format!(
                        "pool `{}` kept changing; gave up after {conflicts} attempts",
                        network.as_ref()
                    )));
                }
                continue;
            }
            gauge!("address_pool_remaining", "network" => network.as_ref().to_string())
                .set(addresses.len() as f64);

            if !self
                .store
                .put_if_absent(
                    Namespace::Addresses,
                    &address_key(&address),
                    user_id.as_str(),
                )
                .await?
            {
                // Provisioning put an already-bound address back in the pool.
                error!(
                    network = network.as_ref(),
                    address, "pooled address is already assigned; discarding"
                );
                continue;
            }

            if self
                .store
                .put_if_absent(Namespace::Addresses, &forward, &address)
                .await?
            {
                info!(user_id = %user_id, network = network.as_ref(), address, "assigned address");
                return Ok(AddressAssignment { address, network });
            }

            // Another process bound this pair first: undo ours and return theirs.
            warn!(user_id = %user_id, network = network.as_ref(), "lost assignment race; releasing address");
            self.store
                .delete(Namespace::Addresses, &address_key(&address))
                .await?;
            self.return_to_pool(network, address).await?;
            return self
                .existing(&forward, network)
                .await?
                .ok_or_else(|| ServiceError::Internal("assignment vanished after commit".into()));
        }
    }

    /// Appends addresses to the pool, skipping blanks, duplicates and anything
    /// already pooled or assigned.
    pub async fn provision_pool(
        &self,
        network: &str,
        addresses: &[String],
    ) -> Result<ProvisionOutcome, ServiceError> {
        let network = Network::parse(network)?;
        let pool = pool_key(network);
        let _guard = self.locks.lock(&pool).await;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for address in addresses {
            let address = address.trim();
            if address.is_empty() || !seen.insert(address.to_string()) {
                continue;
            }
            if self
                .store
                .get(Namespace::Addresses, &address_key(address))
                .await?
                .is_some()
            {
                continue;
            }
            candidates.push(address.to_string());
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.store.get(Namespace::Addresses, &pool).await?;
            let mut pooled = match &current {
                Some(record) => decode_pool(&pool, record)?,
                None => Vec::new(),
            };
            let existing: HashSet<&str> = pooled.iter().map(String::as_str).collect();
            let fresh: Vec<String> = candidates
                .iter()
                .filter(|candidate| !existing.contains(candidate.as_str()))
                .cloned()
                .collect();
            let added = fresh.len();
            pooled.extend(fresh);

            let encoded = encode_pool(&pooled)?;
            let committed = match &current {
                Some(record) => {
                    self.store
                        .put_if_version(Namespace::Addresses, &pool, &encoded, record.version)
                        .await?
                }
                None => {
                    self.store
                        .put_if_absent(Namespace::Addresses, &pool, &encoded)
                        .await?
                }
            };
            if committed {
                gauge!("address_pool_remaining", "network" => network.as_ref().to_string())
                    .set(pooled.len() as f64);
                info!(network = network.as_ref(), added, remaining = pooled.len(), "provisioned pool");
                return Ok(ProvisionOutcome {
                    network,
                    added,
                    skipped: addresses.len() - added,
                    remaining: pooled.len(),
                });
            }
            counter!("store_conflicts_total", "record" => "pool").increment(1);
        }
        Err(ServiceError::Internal(format!(
            "pool `{}` kept changing during provisioning",
            network.as_ref()
        )))
    }

    /// Number of unassigned addresses left; an unprovisioned pool counts as empty.
    pub async fn pool_remaining(&self, network: &str) -> Result<(Network, usize), ServiceError> {
        let network = Network::parse(network)?;
        let pool = pool_key(network);
        let remaining = match self.store.get(Namespace::Addresses, &pool).await? {
            Some(record) => decode_pool(&pool, &record)?.len(),
            None => 0,
        };
        Ok((network, remaining))
    }

    async fn existing(
        &self,
        forward: &str,
        network: Network,
    ) -> Result<Option<AddressAssignment>, ServiceError> {
        Ok(self
            .store
            .get(Namespace::Addresses, forward)
            .await?
            .map(|record| AddressAssignment {
                address: record.value,
                network,
            }))
    }

    async fn return_to_pool(&self, network: Network, address: String) -> Result<(), ServiceError> {
        let pool = pool_key(network);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let committed = match self.store.get(Namespace::Addresses, &pool).await? {
                Some(record) => {
                    let mut addresses = decode_pool(&pool, &record)?;
                    addresses.insert(0, address.clone());
                    self.store
                        .put_if_version(
                            Namespace::Addresses,
                            &pool,
                            &encode_pool(&addresses)?,
                            record.version,
                        )
                        .await?
                }
                None => {
                    self.store
                        .put_if_absent(
                            Namespace::Addresses,
                            &pool,
                            &encode_pool(std::slice::from_ref(&address))?,
                        )
                        .await?
                }
            };
            if committed {
                return Ok(());
            }
        }
        error!(network = network.as_ref(), address, "could not return address to pool");
        Err(ServiceError::Internal("could not return address to pool".into()))
    }
}

fn pool_unavailable(network: Network) -> ServiceError {
    warn!(network = network.as_ref(), "address pool exhausted or unprovisioned");
    ServiceError::Unavailable("No addresses available. Please try again later.".into())
}

fn decode_pool(key: &str, record: &Versioned) -> Result<Vec<String>, ServiceError> {
    serde_json::from_str(&record.value)
        .map_err(|err| StorageError::corrupt(key, err).into())
}

fn encode_pool(addresses: &[String]) -> Result<String, ServiceError> {
    serde_json::to_string(addresses).map_err(|err| ServiceError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;

    async fn seed_pool(store: &InMemoryKvStore, network: Network, addresses: &[&str]) {
        store
            .put(
                Namespace::Addresses,
                &pool_key(network),
                &serde_json::to_string(addresses).unwrap(),
            )
            .await
            .unwrap();
    }

    async fn pool_contents(store: &InMemoryKvStore, network: Network) -> Vec<String> {
        let record = store
            .get(Namespace::Addresses, &pool_key(network))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&record.value).unwrap()
    }

    #[tokio::test]
    async fn pools_drain_in_order_then_report_unavailable() {
        let store = InMemoryKvStore::new();
        seed_pool(&store, Network::Trc20, &["T1", "T2"]).await;
        let allocator = AddressAllocator::new(store.clone(), KeyedLocks::default());

        let a = allocator
            .get_or_assign_address(&UserId::new("a"), "trc20")
            .await
            .unwrap();
        assert_eq!(a.address, "T1");
        assert_eq!(a.network_name(), "USDT (TRC-20)");
        assert_eq!(pool_contents(&store, Network::Trc20).await, vec!["T2"]);

        let b = allocator
            .get_or_assign_address(&UserId::new("b"), "trc20")
            .await
            .unwrap();
        assert_eq!(b.address, "T2");
        assert!(pool_contents(&store, Network::Trc20).await.is_empty());

        let err = allocator
            .get_or_assign_address(&UserId::new("c"), "trc20")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));

        let reverse = store
            .get(Namespace::Addresses, &address_key("T1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reverse.value, "a");
    }

    #[tokio::test]
    async fn repeated_requests_are_idempotent() {
        let store = InMemoryKvStore::new();
        seed_pool(&store, Network::Erc20, &["E1", "E2", "E3"]).await;
        let allocator = AddressAllocator::new(store.clone(), KeyedLocks::default());
        let user = UserId::new("a");

        let first = allocator.get_or_assign_address(&user, "erc20").await.unwrap();
        for _ in 0..3 {
            let again = allocator.get_or_assign_address(&user, "erc20").await.unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(pool_contents(&store, Network::Erc20).await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_requests_pop_once() {
        let store = InMemoryKvStore::new();
        seed_pool(&store, Network::Dai, &["D1", "D2", "D3"]).await;
        let allocator = AddressAllocator::new(store.clone(), KeyedLocks::default());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    allocator
                        .get_or_assign_address(&UserId::new("same"), "dai")
                        .await
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            seen.insert(handle.await.unwrap().unwrap().address);
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(pool_contents(&store, Network::Dai).await, vec!["D2", "D3"]);
    }

    #[tokio::test]
    async fn distinct_users_never_share_an_address() {
        let store = InMemoryKvStore::new();
        let pooled: Vec<String> = (0..16).map(|i| format!("X{i}")).collect();
        let refs: Vec<&str> = pooled.iter().map(String::as_str).collect();
        seed_pool(&store, Network::Xdai, &refs).await;
        let allocator = AddressAllocator::new(store.clone(), KeyedLocks::default());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    allocator
                        .get_or_assign_address(&UserId::new(format!("user-{i}")), "xdai")
                        .await
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap().unwrap().address));
        }
        assert_eq!(seen.len(), 16);
    }

    #[tokio::test]
    async fn unknown_network_and_missing_pool() {
        let allocator = AddressAllocator::new(InMemoryKvStore::new(), KeyedLocks::default());
        assert!(matches!(
            allocator
                .get_or_assign_address(&UserId::new("a"), "btc")
                .await
                .unwrap_err(),
            ServiceError::InvalidInput(_)
        ));
        assert!(matches!(
            allocator
                .get_or_assign_address(&UserId::new("a"), "trc20")
                .await
                .unwrap_err(),
            ServiceError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn provisioning_skips_duplicates_and_assigned_addresses() {
        let store = InMemoryKvStore::new();
        let allocator = AddressAllocator::new(store.clone(), KeyedLocks::default());

        let outcome = allocator
            .provision_pool("trc20", &["T1".into(), "T2".into(), "T1".into(), " ".into()])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProvisionOutcome {
                network: Network::Trc20,
                added: 2,
                skipped: 2,
                remaining: 2
            }
        );

        allocator
            .get_or_assign_address(&UserId::new("a"), "trc20")
            .await
            .unwrap();
        let outcome = allocator
            .provision_pool("trc20", &["T1".into(), "T2".into(), "T3".into()])
            .await
            .unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(pool_contents(&store, Network::Trc20).await, vec!["T2", "T3"]);

        assert_eq!(
            allocator.pool_remaining("trc20").await.unwrap(),
            (Network::Trc20, 2)
        );
        assert_eq!(
            allocator.pool_remaining("dai").await.unwrap(),
            (Network::Dai, 0)
        );
    }

    #[tokio::test]
    async fn already_bound_addresses_in_the_pool_are_discarded() {
        let store = InMemoryKvStore::new();
        seed_pool(&store, Network::Trc20, &["T1", "T2"]).await;
        store
            .put(Namespace::Addresses, &address_key("T1"), "someone-else")
            .await
            .unwrap();
        let allocator = AddressAllocator::new(store.clone(), KeyedLocks::default());

        let assigned = allocator
            .get_or_assign_address(&UserId::new("a"), "trc20")
            .await
            .unwrap();
        assert_eq!(assigned.address, "T2");
    }
}
