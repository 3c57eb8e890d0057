// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Execution endpoints: submit code, stream its output, load extensions,
//! overwrite variables.

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    Json,
};
use ces_api_contract::{
    ExecuteAccepted, ExecuteRequest, ExecutionResult, LoadExtensionRequest, OutputEvent,
    OutputKind, UpdateVariablesRequest,
};
use ces_core::Extension;
use futures::{stream, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;
use validator::Validate;

/// Execute a code unit inside a session.
///
/// With `stream = false` the call blocks until the execution finished and
/// returns the assembled result; interpreter failures surface as a 200 with
/// `success = false`. With `stream = true` the call returns 202 and a
/// pointer to the live SSE stream; both paths execute identically.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Assembled execution result", body = ExecutionResult),
        (status = 202, description = "Execution admitted; stream for output", body = ExecuteAccepted),
        (status = 409, description = "Duplicate execution id or stopped session")
    )
)]
pub async fn execute(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> ServerResult<Response> {
    request.validate()?;
    let session = state.manager.get(&session_id).await?;
    let (_hub, reply) = session
        .execute(request.exec_id.clone(), request.code.clone())
        .await?;

    if request.stream {
        let accepted = ExecuteAccepted {
            stream_url: format!(
                "/api/v1/sessions/{}/execute/{}/stream",
                session_id, request.exec_id
            ),
            exec_id: request.exec_id,
        };
        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    let result = reply
        .await
        .map_err(|_| ServerError::Internal("session dropped the execution reply".to_string()))??;
    Ok(Json(result).into_response())
}

type ExecutionSseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Subscribe to an execution's output events.
///
/// Replays from sequence zero on every connect, so reconnecting clients
/// converge with live ones.
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/execute/{exec_id}/stream",
    responses(
        (status = 200, description = "SSE stream of output events"),
        (status = 404, description = "Unknown session or execution")
    )
)]
pub async fn stream_execution(
    State(state): State<AppState>,
    Path((session_id, exec_id)): Path<(String, String)>,
) -> ServerResult<Sse<KeepAliveStream<ExecutionSseStream>>> {
    let session = state.manager.get(&session_id).await?;
    let hub = session
        .execution_hub(&exec_id)
        .ok_or_else(|| ServerError::NotFound(format!("execution '{}' not found", exec_id)))?;

    let stream: ExecutionSseStream = Box::pin(
        hub.subscribe()
            .into_stream()
            .flat_map(|event| stream::iter(sse_frames(event))),
    );

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// Frame one hub event into its SSE representation.
///
/// Textual kinds become `output` events; the terminal event becomes a
/// `result` event followed by `done`. Other kinds only appear inside the
/// assembled result.
fn sse_frames(event: OutputEvent) -> Vec<Result<Event, Infallible>> {
    let mut frames = Vec::new();
    if event.terminal {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        frames.push(Ok(Event::default().event("result").data(data)));
        frames.push(Ok(Event::default().event("done").data("")));
        return frames;
    }
    if matches!(
        event.kind,
        OutputKind::Stdout
            | OutputKind::Stderr
            | OutputKind::Log
            | OutputKind::Display
            | OutputKind::Truncated
    ) {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        frames.push(Ok(Event::default().event("output").data(data)));
    }
    frames
}

/// Load an extension into a session.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/plugins",
    request_body = LoadExtensionRequest,
    responses(
        (status = 200, description = "Extension loaded"),
        (status = 400, description = "Extension load failed; detail carries the interpreter error")
    )
)]
pub async fn load_extension(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<LoadExtensionRequest>,
) -> ServerResult<Json<serde_json::Value>> {
    request.validate()?;
    let session = state.manager.get(&session_id).await?;
    session
        .load_extension(Extension {
            name: request.name.clone(),
            source: request.source,
            config: request.config,
        })
        .await?;
    Ok(Json(json!({ "name": request.name, "loaded": true })))
}

/// Overwrite user-namespace bindings.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/variables",
    request_body = UpdateVariablesRequest,
    responses(
        (status = 204, description = "Bindings applied")
    )
)]
pub async fn update_variables(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateVariablesRequest>,
) -> ServerResult<StatusCode> {
    let session = state.manager.get(&session_id).await?;
    session.update_variables(request.bindings).await?;
    Ok(StatusCode::NO_CONTENT)
}
