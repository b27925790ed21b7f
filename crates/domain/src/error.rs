use thiserror::Error;

use crate::model::ModelError;
use crate::provider::ProviderError;
use crate::storage::StorageError;

/// Failure kinds surfaced by the credential, allocation, metering and
/// conversion services. The HTTP layer maps each kind to one status code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("extraction provider failed")]
    Gateway { detail: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized("Invalid credentials".into())
    }

    pub fn user_not_found() -> Self {
        Self::NotFound("User not found".into())
    }
}

impl From<StorageError> for ServiceError {
    fn from(value: StorageError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<ModelError> for ServiceError {
    fn from(value: ModelError) -> Self {
        match value {
            ModelError::Entropy(_) => Self::Internal(value.to_string()),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

impl From<ProviderError> for ServiceError {
    fn from(value: ProviderError) -> Self {
        Self::Gateway {
            detail: value.to_string(),
        }
    }
}
