pub mod account;
pub mod auth;
pub mod convert;
pub mod health;
pub mod payments;
pub mod pools;

pub use account::{
    balance_handler, regenerate_key_handler, setup_two_factor_handler, verify_two_factor_handler,
};
pub use auth::{login_handler, register_handler};
pub use convert::convert_handler;
pub use health::{health_handler, metrics_handler};
pub use payments::get_address_handler;
pub use pools::{pool_status_handler, provision_pool_handler};

use actix_web::{http::StatusCode, HttpRequest, HttpResponse, ResponseError};
use any2json_domain::error::ServiceError;
use serde::Serialize;
use strum_macros::IntoStaticStr;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid request body")]
    InvalidBody(String),
    #[error("Not found")]
    RouteNotFound,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Service(err) => match err {
                ServiceError::InvalidInput(_) | ServiceError::Conflict(_) => {
                    StatusCode::BAD_REQUEST
                }
                ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
                ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                ServiceError::Gateway { .. } => StatusCode::BAD_GATEWAY,
                ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ApiError::Service(ServiceError::Gateway { detail }) => ErrorBody {
                error: self.to_string(),
                details: Some(detail.clone()),
            },
            ApiError::Service(ServiceError::Internal(reason)) => {
                error!(reason, "request failed with an internal error");
                ErrorBody {
                    error: "Internal server error".into(),
                    details: Some(reason.clone()),
                }
            }
            ApiError::InvalidBody(reason) => ErrorBody {
                error: self.to_string(),
                details: Some(reason.clone()),
            },
            _ => ErrorBody {
                error: self.to_string(),
                details: None,
            },
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Metric label for a request outcome.
#[derive(Debug, Clone, Copy, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Outcome {
    Success,
    InvalidInput,
    Unauthorized,
    Conflict,
    NotFound,
    Unavailable,
    GatewayError,
    Internal,
}

impl Outcome {
    pub(crate) fn label(self) -> &'static str {
        self.into()
    }

    pub(crate) fn of<T>(result: &Result<T, ApiError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(ApiError::Service(err)) => match err {
                ServiceError::InvalidInput(_) => Outcome::InvalidInput,
                ServiceError::Unauthorized(_) => Outcome::Unauthorized,
                ServiceError::Conflict(_) => Outcome::Conflict,
                ServiceError::NotFound(_) => Outcome::NotFound,
                ServiceError::Unavailable(_) => Outcome::Unavailable,
                ServiceError::Gateway { .. } => Outcome::GatewayError,
                ServiceError::Internal(_) => Outcome::Internal,
            },
            Err(ApiError::Unauthorized) => Outcome::Unauthorized,
            Err(ApiError::InvalidBody(_)) => Outcome::InvalidInput,
            Err(ApiError::RouteNotFound) => Outcome::NotFound,
        }
    }
}

pub async fn preflight_handler() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

pub async fn not_found_handler(_req: HttpRequest) -> Result<HttpResponse, ApiError> {
    Err(ApiError::RouteNotFound)
}

pub fn json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &HttpRequest,
) -> actix_web::Error {
    ApiError::InvalidBody(err.to_string()).into()
}
