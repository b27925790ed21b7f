use metrics::counter;
use tracing::warn;

use crate::error::ServiceError;
use crate::model::{User, UserId};
use crate::storage::{user_key, KvStore, Namespace, StorageError};

use super::MAX_WRITE_ATTEMPTS;

pub(crate) async fn load_user<S: KvStore>(
    store: &S,
    id: &UserId,
) -> Result<Option<(User, i64)>, ServiceError> {
    let key = user_key(id);
    let Some(record) = store.get(Namespace::Users, &key).await? else {
        return Ok(None);
    };
    let user: User = serde_json::from_str(&record.value)
        .map_err(|err| StorageError::corrupt(key.as_str(), err))?;
    Ok(Some((user, record.version)))
}

pub(crate) fn encode_user(user: &User) -> Result<String, ServiceError> {
    serde_json::to_string(user).map_err(|err| ServiceError::Internal(err.to_string()))
}

/// Applies `mutate` to the stored user record with a version-checked write,
/// re-reading and retrying when another writer committed in between.
pub(crate) async fn update_user<S, F>(
    store: &S,
    id: &UserId,
    mut mutate: F,
) -> Result<User, ServiceError>
where
    S: KvStore,
    F: FnMut(&mut User) -> Result<(), ServiceError>,
{
    let key = user_key(id);
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let Some((mut user, version)) = load_user(store, id).await? else {
            return Err(ServiceError::user_not_found());
        };
        mutate(&mut user)?;
        let encoded = encode_user(&user)?;
        if store
            .put_if_version(Namespace::Users, &key, &encoded, version)
            .await?
        {
            return Ok(user);
        }
        counter!("store_conflicts_total", "record" => "user").increment(1);
        warn!(user_id = %id, attempt, "user record changed concurrently; retrying");
    }
    Err(ServiceError::Internal(format!(
        "user record `{id}` kept changing; gave up after {MAX_WRITE_ATTEMPTS} attempts"
    )))
}
