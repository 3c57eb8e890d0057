// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session management endpoints

use crate::error::ServerResult;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use ces_api_contract::{
    CreateSessionRequest, SessionListResponse, SessionSummary,
};

/// List sessions
#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    responses(
        (status = 200, description = "Session metadata snapshot", body = SessionListResponse)
    )
)]
pub async fn list_sessions(
    State(state): State<AppState>,
) -> ServerResult<Json<SessionListResponse>> {
    let items = state.manager.list().await;
    let total = items.len() as u32;
    Ok(Json(SessionListResponse { items, total }))
}

/// Create a session and boot its interpreter
#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionSummary),
        (status = 409, description = "Session id already exists")
    )
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ServerResult<(StatusCode, Json<SessionSummary>)> {
    let summary = state.manager.create(request.session_id).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// Session details
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionSummary),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ServerResult<Json<SessionSummary>> {
    let session = state.manager.get(&session_id).await?;
    Ok(Json(session.summary()))
}

/// Stop and remove a session
#[utoipa::path(
    delete,
    path = "/api/v1/sessions/{id}",
    responses(
        (status = 204, description = "Session stopped and removed"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ServerResult<StatusCode> {
    state.manager.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
