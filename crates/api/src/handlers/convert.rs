use actix_web::{web, HttpRequest, HttpResponse};
use any2json_domain::services::ConversionRequest;
use metrics::counter;

use crate::state::AppState;

use super::{auth::authenticate, ApiError, Outcome};

pub async fn convert_handler(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Json<ConversionRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = authenticate(&req, &state)?;
    let result = state
        .conversion()
        .handle(&user_id, payload.into_inner())
        .await
        .map_err(ApiError::from);
    counter!("api_convert_requests_total", "status" => Outcome::of(&result).label()).increment(1);

    Ok(HttpResponse::Ok().json(result?))
}
