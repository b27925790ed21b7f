//! Time-based one-time codes (RFC 6238) for the optional second login factor.

use chrono::Utc;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::ServiceError;
use crate::model::ModelError;

/// Issuer shown by authenticator apps next to the account name.
pub const TOTP_ISSUER: &str = "any2json";

const SECRET_BYTES: usize = 20;
const DIGITS: usize = 6;
const STEP_SECS: u64 = 30;
/// Codes from one step before or after the current one are still accepted.
const SKEW_STEPS: u8 = 1;

/// Material handed to the user when enrolling an authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoFactorSetup {
    /// Base32 shared secret, for manual entry.
    pub secret: String,
    /// `otpauth://totp/...` URI, usually rendered as a QR code.
    pub otpauth_url: String,
}

/// Draws a fresh shared secret bound to `account`.
pub(crate) fn enroll(account: &str) -> Result<TwoFactorSetup, ServiceError> {
    let mut bytes = [0u8; SECRET_BYTES];
    getrandom::fill(&mut bytes).map_err(|err| ModelError::Entropy(err.to_string()))?;
    let totp = build(bytes.to_vec(), account)?;
    Ok(TwoFactorSetup {
        secret: totp.get_secret_base32(),
        otpauth_url: totp.get_url(),
    })
}

/// Checks `code` against the stored base32 `secret` at `unix_secs`.
pub(crate) fn code_matches(
    secret: &str,
    account: &str,
    code: &str,
    unix_secs: u64,
) -> Result<bool, ServiceError> {
    let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    Ok(from_stored(secret, account)?.check(&code, unix_secs))
}

pub(crate) fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

#[cfg(test)]
pub(crate) fn code_at(secret: &str, account: &str, unix_secs: u64) -> String {
    from_stored(secret, account)
        .expect("stored secret decodes")
        .generate(unix_secs)
}

fn from_stored(secret: &str, account: &str) -> Result<TOTP, ServiceError> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|err| ServiceError::Internal(format!("stored totp secret unreadable: {err:?}")))?;
    build(bytes, account)
}

fn build(secret: Vec<u8>, account: &str) -> Result<TOTP, ServiceError> {
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW_STEPS,
        STEP_SECS,
        secret,
        Some(TOTP_ISSUER.to_string()),
        // `:` separates issuer and account in the otpauth label.
        account.replace(':', "_"),
    )
    .map_err(|err| ServiceError::Internal(format!("totp setup rejected: {err:?}")))
}
