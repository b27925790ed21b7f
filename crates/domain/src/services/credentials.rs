use pbkdf2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Params, Pbkdf2,
};
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::model::{ApiKey, Email, ModelError, User, UserId};
use crate::storage::{api_key_key, email_key, user_key, KvStore, Namespace};

use super::locks::KeyedLocks;
use super::token::TokenSigner;
use super::two_factor::{self, TwoFactorSetup};
use super::users::{encode_user, load_user, update_user};
use super::MAX_WRITE_ATTEMPTS;

/// PBKDF2-SHA256 iteration count for new password digests. Stored digests
/// carry their own parameters, so raising this only affects new accounts.
pub const DEFAULT_PASSWORD_ROUNDS: u32 = 100_000;

const PASSWORD_SALT_BYTES: usize = 16;
const PASSWORD_OUTPUT_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub token: String,
    pub api_key: ApiKey,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated { token: String, api_key: ApiKey },
    /// Password accepted; the account also needs a TOTP code.
    SecondFactorRequired,
}

/// Registers and authenticates users and issues their bearer tokens.
#[derive(Clone)]
pub struct CredentialService<S> {
    store: S,
    signer: TokenSigner,
    locks: KeyedLocks,
    password_rounds: u32,
}

impl<S: KvStore> CredentialService<S> {
    pub fn new(store: S, signer: TokenSigner, locks: KeyedLocks) -> Self {
        Self {
            store,
            signer,
            locks,
            password_rounds: DEFAULT_PASSWORD_ROUNDS,
        }
    }

    pub fn with_password_rounds(mut self, rounds: u32) -> Self {
        self.password_rounds = rounds.max(1);
        self
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<Registration, ServiceError> {
        let email = Email::parse(email)?;
        if password.is_empty() {
            return Err(ModelError::MissingPassword.into());
        }

        let email_slot = email_key(&email);
        let _guard = self.locks.lock(&email_slot).await;
        if self
            .store
            .get(Namespace::Users, &email_slot)
            .await?
            .is_some()
        {
            return Err(email_taken());
        }

        let password_hash = hash_password(password.to_string(), self.password_rounds).await?;
        let user_id = UserId::generate();
        let api_key = self.claim_api_key(&user_id).await?;
        let user = User::new(user_id.clone(), email.clone(), password_hash, api_key.clone());

        self.store
            .put(Namespace::Users, &user_key(&user_id), &encode_user(&user)?)
            .await?;

        // The e-mail claim is the commit point: losing it means another
        // process registered the same address first.
        if !self
            .store
            .put_if_absent(Namespace::Users, &email_slot, user_id.as_str())
            .await?
        {
            warn!(email = email.as_str(), "concurrent registration lost the e-mail claim");
            self.store
                .delete(Namespace::Users, &api_key_key(&api_key))
                .await?;
            self.store
                .delete(Namespace::Users, &user_key(&user_id))
                .await?;
            return Err(email_taken());
        }

        info!(user_id = %user_id, "registered user");
        Ok(Registration {
            token: self.signer.issue(&user_id),
            api_key,
            user_id,
        })
    }

    /// `totp_code` is only consulted for accounts with two-factor enabled;
    /// without it such accounts get [`LoginOutcome::SecondFactorRequired`].
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        totp_code: Option<&str>,
    ) -> Result<LoginOutcome, ServiceError> {
        let email = Email::parse(email).map_err(|_| ServiceError::unauthorized())?;
        let Some(owner) = self
            .store
            .get(Namespace::Users, &email_key(&email))
            .await?
        else {
            return Err(ServiceError::unauthorized());
        };
        let user_id = UserId::new(owner.value);
        let Some((user, _)) = load_user(&self.store, &user_id).await? else {
            error!(user_id = %user_id, "e-mail index points at a missing user record");
            return Err(ServiceError::unauthorized());
        };

        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            return Err(ServiceError::unauthorized());
        }

        if user.totp_enabled {
            let Some(code) = totp_code.map(str::trim).filter(|code| !code.is_empty()) else {
                return Ok(LoginOutcome::SecondFactorRequired);
            };
            let secret = user.totp_secret.as_deref().ok_or_else(|| {
                ServiceError::Internal(format!("user `{}` has 2FA enabled without a secret", user.id))
            })?;
            if !two_factor::code_matches(secret, user.email.as_str(), code, two_factor::unix_now())? {
                return Err(ServiceError::Unauthorized("Invalid 2FA code".into()));
            }
        }

        Ok(LoginOutcome::Authenticated {
            token: self.signer.issue(&user.id),
            api_key: user.api_key,
        })
    }

    /// Stores a fresh TOTP secret for the user. Two-factor stays in its
    /// current state until a code is verified against the new secret.
    pub async fn setup_two_factor(&self, user_id: &UserId) -> Result<TwoFactorSetup, ServiceError> {
        let _guard = self.locks.lock(&user_key(user_id)).await;
        let Some((user, _)) = load_user(&self.store, user_id).await? else {
            return Err(ServiceError::user_not_found());
        };

        let setup = two_factor::enroll(user.email.as_str())?;
        update_user(&self.store, user_id, |user| {
            user.totp_secret = Some(setup.secret.clone());
            Ok(())
        })
        .await?;
        info!(user_id = %user_id, "issued totp secret");
        Ok(setup)
    }

    /// Enables two-factor when `code` matches the stored secret. Returns
    /// whether it matched.
    pub async fn verify_two_factor(&self, user_id: &UserId, code: &str) -> Result<bool, ServiceError> {
        let _guard = self.locks.lock(&user_key(user_id)).await;
        let Some((user, _)) = load_user(&self.store, user_id).await? else {
            return Err(ServiceError::user_not_found());
        };
        let Some(secret) = user.totp_secret else {
            return Err(ServiceError::InvalidInput("2FA not set up".into()));
        };
        if code.trim().is_empty() {
            return Err(ServiceError::InvalidInput("2FA code is required".into()));
        }

        if !two_factor::code_matches(&secret, user.email.as_str(), code, two_factor::unix_now())? {
            return Ok(false);
        }
        update_user(&self.store, user_id, |user| {
            if user.totp_secret.as_deref() != Some(secret.as_str()) {
                return Err(ServiceError::Conflict("2FA secret changed; verify again".into()));
            }
            user.totp_enabled = true;
            Ok(())
        })
        .await?;
        info!(user_id = %user_id, "enabled two-factor login");
        Ok(true)
    }

    pub fn issue_token(&self, user_id: &UserId) -> String {
        self.signer.issue(user_id)
    }

    pub fn verify_token(&self, token: &str) -> Option<UserId> {
        self.signer.verify(token)
    }

    pub async fn find_user(&self, user_id: &UserId) -> Result<User, ServiceError> {
        load_user(&self.store, user_id)
            .await?
            .map(|(user, _)| user)
            .ok_or_else(ServiceError::user_not_found)
    }

    /// Replaces the user's API key; the previous key stops resolving.
    pub async fn regenerate_api_key(&self, user_id: &UserId) -> Result<ApiKey, ServiceError> {
        let _guard = self.locks.lock(&user_key(user_id)).await;
        if load_user(&self.store, user_id).await?.is_none() {
            return Err(ServiceError::user_not_found());
        }

        let fresh = self.claim_api_key(user_id).await?;
        let mut previous = None;
        let updated = update_user(&self.store, user_id, |user| {
            previous = Some(user.api_key.clone());
            user.api_key = fresh.clone();
            Ok(())
        })
        .await;

        match updated {
            Ok(_) => {
                if let Some(old) = previous {
                    self.store
                        .delete(Namespace::Users, &api_key_key(&old))
                        .await?;
                }
                info!(user_id = %user_id, "rotated api key");
                Ok(fresh)
            }
            Err(err) => {
                self.store
                    .delete(Namespace::Users, &api_key_key(&fresh))
                    .await?;
                Err(err)
            }
        }
    }

    async fn claim_api_key(&self, owner: &UserId) -> Result<ApiKey, ServiceError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let candidate = ApiKey::generate()?;
            if self
                .store
                .put_if_absent(Namespace::Users, &api_key_key(&candidate), owner.as_str())
                .await?
            {
                return Ok(candidate);
            }
        }
        Err(ServiceError::Internal(
            "could not allocate a unique api key".into(),
        ))
    }
}

fn email_taken() -> ServiceError {
    ServiceError::Conflict("Email already registered".into())
}

async fn hash_password(password: String, rounds: u32) -> Result<String, ServiceError> {
    let mut salt_bytes = [0u8; PASSWORD_SALT_BYTES];
    getrandom::fill(&mut salt_bytes).map_err(|err| ModelError::Entropy(err.to_string()))?;

    tokio::task::spawn_blocking(move || {
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        let params = Params {
            rounds,
            output_length: PASSWORD_OUTPUT_LEN,
        };
        Pbkdf2
            .hash_password_customized(password.as_bytes(), None, None, params, &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| ServiceError::Internal(err.to_string()))
    })
    .await
    .map_err(|err| ServiceError::Internal(err.to_string()))?
}

async fn verify_password(password: String, stored: String) -> Result<bool, ServiceError> {
    tokio::task::spawn_blocking(move || match PasswordHash::new(&stored) {
        Ok(parsed) => Ok(Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok()),
        Err(err) => Err(ServiceError::Internal(format!(
            "stored password digest unreadable: {err}"
        ))),
    })
    .await
    .map_err(|err| ServiceError::Internal(err.to_string()))?
}
