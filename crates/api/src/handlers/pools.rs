use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub network: String,
    pub added: usize,
    pub skipped: usize,
    pub remaining: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatusResponse {
    pub network: String,
    pub network_name: String,
    pub remaining: usize,
}

pub async fn provision_pool_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ProvisionRequest>,
) -> Result<HttpResponse, ApiError> {
    let outcome = state
        .allocator()
        .provision_pool(&path.into_inner(), &payload.addresses)
        .await?;
    info!(
        network = outcome.network.as_ref(),
        added = outcome.added,
        "pool provisioned over the internal api"
    );

    Ok(HttpResponse::Ok().json(ProvisionResponse {
        network: outcome.network.as_ref().to_string(),
        added: outcome.added,
        skipped: outcome.skipped,
        remaining: outcome.remaining,
    }))
}

pub async fn pool_status_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let (network, remaining) = state.allocator().pool_remaining(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PoolStatusResponse {
        network: network.as_ref().to_string(),
        network_name: network.display_name().to_string(),
        remaining,
    }))
}
