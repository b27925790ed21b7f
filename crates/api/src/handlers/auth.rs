use actix_web::{http::header, web, HttpRequest, HttpResponse};
use any2json_domain::model::UserId;
use any2json_domain::services::LoginOutcome;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::{ApiError, Outcome};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Only read by login, for accounts with two-factor enabled.
    #[serde(default)]
    pub totp_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub token: String,
    pub api_key: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub api_key: String,
}

/// Login answer for a correct password on a two-factor account.
#[derive(Debug, Serialize, Deserialize)]
pub struct SecondFactorChallenge {
    pub requires_2fa: bool,
}

pub async fn register_handler(
    state: web::Data<AppState>,
    payload: web::Json<CredentialsRequest>,
) -> Result<HttpResponse, ApiError> {
    let payload = payload.into_inner();
    let result = state
        .credentials()
        .register(
            payload.email.as_deref().unwrap_or_default(),
            payload.password.as_deref().unwrap_or_default(),
        )
        .await
        .map_err(ApiError::from);
    counter!("api_auth_requests_total", "endpoint" => "register", "status" => Outcome::of(&result).label()).increment(1);

    let registration = result?;
    Ok(HttpResponse::Ok().json(RegisterResponse {
        token: registration.token,
        api_key: registration.api_key.into_inner(),
        user_id: registration.user_id.into_inner(),
    }))
}

pub async fn login_handler(
    state: web::Data<AppState>,
    payload: web::Json<CredentialsRequest>,
) -> Result<HttpResponse, ApiError> {
    let payload = payload.into_inner();
    let result = state
        .credentials()
        .login(
            payload.email.as_deref().unwrap_or_default(),
            payload.password.as_deref().unwrap_or_default(),
            payload.totp_code.as_deref(),
        )
        .await
        .map_err(ApiError::from);
    counter!("api_auth_requests_total", "endpoint" => "login", "status" => Outcome::of(&result).label()).increment(1);

    match result? {
        LoginOutcome::Authenticated { token, api_key } => Ok(HttpResponse::Ok().json(LoginResponse {
            token,
            api_key: api_key.into_inner(),
        })),
        LoginOutcome::SecondFactorRequired => {
            Ok(HttpResponse::Ok().json(SecondFactorChallenge { requires_2fa: true }))
        }
    }
}

/// Resolves the `Authorization: Bearer <token>` header to a user id.
pub(crate) fn authenticate(req: &HttpRequest, state: &AppState) -> Result<UserId, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    state
        .credentials()
        .verify_token(token)
        .ok_or(ApiError::Unauthorized)
}
