use actix_web::{web, HttpRequest, HttpResponse};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::{auth::authenticate, ApiError, Outcome};

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: f64,
    pub used: f64,
    pub tier: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateKeyResponse {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorSetupResponse {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TwoFactorVerifyRequest {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TwoFactorVerifyResponse {
    pub success: bool,
}

fn count(endpoint: &'static str, outcome: Outcome) {
    counter!("api_account_requests_total", "endpoint" => endpoint, "status" => outcome.label())
        .increment(1);
}

pub async fn balance_handler(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user_id = authenticate(&req, &state)?;
    let result = state
        .credentials()
        .find_user(&user_id)
        .await
        .map_err(ApiError::from);
    count("balance", Outcome::of(&result));

    let user = result?;
    Ok(HttpResponse::Ok().json(BalanceResponse {
        balance: user.balance,
        used: user.used,
        tier: user.tier,
    }))
}

pub async fn regenerate_key_handler(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user_id = authenticate(&req, &state)?;
    let result = state
        .credentials()
        .regenerate_api_key(&user_id)
        .await
        .map_err(ApiError::from);
    count("regenerate_key", Outcome::of(&result));

    Ok(HttpResponse::Ok().json(RegenerateKeyResponse {
        api_key: result?.into_inner(),
    }))
}

pub async fn setup_two_factor_handler(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user_id = authenticate(&req, &state)?;
    let result = state
        .credentials()
        .setup_two_factor(&user_id)
        .await
        .map_err(ApiError::from);
    count("2fa_setup", Outcome::of(&result));

    let setup = result?;
    Ok(HttpResponse::Ok().json(TwoFactorSetupResponse {
        secret: setup.secret,
        otpauth_url: setup.otpauth_url,
    }))
}

pub async fn verify_two_factor_handler(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<TwoFactorVerifyRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = authenticate(&req, &state)?;
    let code = payload.into_inner().code.unwrap_or_default();
    let result = state
        .credentials()
        .verify_two_factor(&user_id, &code)
        .await
        .map_err(ApiError::from);
    count("2fa_verify", Outcome::of(&result));

    Ok(HttpResponse::Ok().json(TwoFactorVerifyResponse { success: result? }))
}
