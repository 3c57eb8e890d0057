//! Health check endpoint

use crate::error::ServerResult;
use crate::state::AppState;
use axum::{extract::State, Json};
use ces_api_contract::HealthResponse;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> ServerResult<Json<HealthResponse>> {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.manager.active_count().await as u32,
    };
    Ok(Json(response))
}
