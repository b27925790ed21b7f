use metrics::{counter, histogram};
use tracing::info;

use crate::config::BillingConfig;
use crate::error::ServiceError;
use crate::model::{Pricing, ProviderUsage, User, UserId};
use crate::storage::{user_key, KvStore};

use super::locks::KeyedLocks;
use super::users::{load_user, update_user};

/// Raw provider cost times margin. Pure and unrounded; only presentation code
/// may round the result.
pub fn compute_cost(usage: &ProviderUsage, pricing: &Pricing, margin: f64) -> f64 {
    (usage.prompt_tokens as f64 * pricing.input_rate
        + usage.completion_tokens as f64 * pricing.output_rate)
        * margin
}

/// Accumulates billed cost into the user's `used` counter.
#[derive(Clone)]
pub struct MeteringService<S> {
    store: S,
    locks: KeyedLocks,
    billing: BillingConfig,
}

impl<S: KvStore> MeteringService<S> {
    pub fn new(store: S, locks: KeyedLocks, billing: BillingConfig) -> Self {
        Self {
            store,
            locks,
            billing,
        }
    }

    pub fn billing(&self) -> &BillingConfig {
        &self.billing
    }

    pub fn cost_of(&self, usage: &ProviderUsage) -> f64 {
        compute_cost(usage, &self.billing.pricing(), self.billing.margin())
    }

    pub async fn ensure_user(&self, user_id: &UserId) -> Result<User, ServiceError> {
        load_user(&self.store, user_id)
            .await?
            .map(|(user, _)| user)
            .ok_or_else(ServiceError::user_not_found)
    }

    /// Adds `cost` to `used`. Writes are serialized per user and committed
    /// with a version check so concurrent charges never overwrite each other.
    pub async fn apply_usage(&self, user_id: &UserId, cost: f64) -> Result<User, ServiceError> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(ServiceError::Internal(format!(
                "refusing to bill invalid cost {cost}"
            )));
        }

        let _guard = self.locks.lock(&user_key(user_id)).await;
        let user = update_user(&self.store, user_id, |user| {
            user.used += cost;
            Ok(())
        })
        .await?;

        counter!("billing_usage_applied_total").increment(1);
        histogram!("billing_cost").record(cost);
        info!(user_id = %user_id, cost, used = user.used, "applied usage");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiKey, Email};
    use crate::storage::{InMemoryKvStore, Namespace};

    async fn seed_user(store: &InMemoryKvStore, id: &str) -> UserId {
        let id = UserId::new(id);
        let user = User::new(
            id.clone(),
            Email::parse("a@x.com").unwrap(),
            "hash".into(),
            ApiKey::new("a2j_test"),
        );
        store
            .put(
                Namespace::Users,
                &user_key(&id),
                &serde_json::to_string(&user).unwrap(),
            )
            .await
            .unwrap();
        id
    }

    #[test]
    fn cost_is_deterministic() {
        let usage = ProviderUsage {
            prompt_tokens: 1000,
            completion_tokens: 500,
            total_tokens: 1500,
        };
        let pricing = Pricing {
            input_rate: 0.000_003,
            output_rate: 0.000_015,
        };
        let expected = (1000.0 * 0.000_003 + 500.0 * 0.000_015) * 1.5;
        for _ in 0..3 {
            assert_eq!(compute_cost(&usage, &pricing, 1.5), expected);
        }
        assert_eq!(compute_cost(&ProviderUsage::default(), &pricing, 1.5), 0.0);
    }

    #[tokio::test]
    async fn usage_accumulates() {
        let store = InMemoryKvStore::new();
        let id = seed_user(&store, "u1").await;
        let metering = MeteringService::new(store, KeyedLocks::default(), BillingConfig::default());

        metering.apply_usage(&id, 0.25).await.unwrap();
        let user = metering.apply_usage(&id, 0.5).await.unwrap();
        assert_eq!(user.used, 0.75);
        assert_eq!(metering.ensure_user(&id).await.unwrap().used, 0.75);
    }

    #[tokio::test]
    async fn concurrent_charges_are_not_lost() {
        let store = InMemoryKvStore::new();
        let id = seed_user(&store, "u1").await;
        let metering = MeteringService::new(store, KeyedLocks::default(), BillingConfig::default());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let metering = metering.clone();
                let id = id.clone();
                tokio::spawn(async move { metering.apply_usage(&id, 0.5).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(metering.ensure_user(&id).await.unwrap().used, 10.0);
    }

    #[tokio::test]
    async fn invalid_cost_and_missing_user_are_rejected() {
        let store = InMemoryKvStore::new();
        let id = seed_user(&store, "u1").await;
        let metering = MeteringService::new(store, KeyedLocks::default(), BillingConfig::default());

        assert!(metering.apply_usage(&id, -1.0).await.is_err());
        assert!(metering.apply_usage(&id, f64::NAN).await.is_err());
        assert!(matches!(
            metering
                .apply_usage(&UserId::new("ghost"), 1.0)
                .await
                .unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert_eq!(metering.ensure_user(&id).await.unwrap().used, 0.0);
    }
}
