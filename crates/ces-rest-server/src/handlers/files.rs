// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File transfer endpoints: upload into and download out of a session cwd.

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ces_api_contract::{validation, UploadFileRequest, UploadFileResponse};
use ces_core::artifacts::mime_for_path;
use validator::Validate;

/// Upload a file into the session working directory.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/files",
    request_body = UploadFileRequest,
    responses(
        (status = 201, description = "File written", body = UploadFileResponse),
        (status = 400, description = "Invalid filename or base64 body")
    )
)]
pub async fn upload_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UploadFileRequest>,
) -> ServerResult<(StatusCode, Json<UploadFileResponse>)> {
    request.validate()?;
    validation::validate_filename(&request.filename)?;
    let bytes = BASE64
        .decode(request.content_base64.as_bytes())
        .map_err(|err| ServerError::BadRequest(format!("invalid base64 content: {}", err)))?;

    let session = state.manager.get(&session_id).await?;
    let path = session.cwd().join(&request.filename);
    let size_bytes = bytes.len() as u64;
    tokio::fs::write(&path, bytes).await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadFileResponse {
            filename: request.filename,
            size_bytes,
        }),
    ))
}

/// Download a file from the session working directory.
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/artifacts/{file}",
    responses(
        (status = 200, description = "Raw file content"),
        (status = 400, description = "Path-escaping filename"),
        (status = 404, description = "Unknown session or file")
    )
)]
pub async fn download_artifact(
    State(state): State<AppState>,
    Path((session_id, file_name)): Path<(String, String)>,
) -> ServerResult<Response> {
    validation::validate_filename(&file_name)?;
    let session = state.manager.get(&session_id).await?;
    let path = session.cwd().join(&file_name);

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServerError::NotFound(format!(
                "artifact '{}' not found",
                file_name
            )));
        }
        Err(err) => return Err(err.into()),
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_for_path(&path))
        .body(Body::from(bytes))
        .map_err(|err| ServerError::Internal(err.to_string()))?;
    Ok(response)
}
