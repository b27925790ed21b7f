use actix_web::{web, HttpRequest, HttpResponse};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::{auth::authenticate, ApiError, Outcome};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AddressRequest {
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub address: String,
    pub network: String,
    pub network_name: String,
}

pub async fn get_address_handler(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<AddressRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = authenticate(&req, &state)?;
    let network = payload.into_inner().network.unwrap_or_default();
    let result = state
        .allocator()
        .get_or_assign_address(&user_id, &network)
        .await
        .map_err(ApiError::from);
    counter!("api_address_requests_total", "status" => Outcome::of(&result).label()).increment(1);

    let assignment = result?;
    Ok(HttpResponse::Ok().json(AddressResponse {
        network_name: assignment.network_name().to_string(),
        network: assignment.network.as_ref().to_string(),
        address: assignment.address,
    }))
}
