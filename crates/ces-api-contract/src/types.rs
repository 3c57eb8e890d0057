// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! API contract types for the code execution service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Lifecycle state of a session.
///
/// The state is monotone: once a session reaches `Stopped` it never leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status_str = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        };
        write!(f, "{}", status_str)
    }
}

/// Session metadata as returned by list/get endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub execution_count: u64,
    pub status: SessionStatus,
}

/// Request body for `POST /sessions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct CreateSessionRequest {
    /// Client-supplied session identifier; the server mints one when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Session list response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct SessionListResponse {
    pub items: Vec<SessionSummary>,
    pub total: u32,
}

/// Request body for `POST /sessions/{id}/plugins`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct LoadExtensionRequest {
    #[validate(length(min = 1, message = "Extension name cannot be empty"))]
    pub name: String,
    #[validate(length(min = 1, message = "Extension source cannot be empty"))]
    pub source: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Request body for `POST /sessions/{id}/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct ExecuteRequest {
    /// Caller-supplied execution identifier, unique within the session.
    #[validate(length(min = 1, message = "exec_id cannot be empty"))]
    pub exec_id: String,
    pub code: String,
    /// When true the call returns 202 with a stream URL instead of blocking.
    #[serde(default)]
    pub stream: bool,
}

/// Response body for a streaming execute (HTTP 202).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct ExecuteAccepted {
    pub exec_id: String,
    pub stream_url: String,
}

/// Request body for `POST /sessions/{id}/variables`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct UpdateVariablesRequest {
    pub bindings: HashMap<String, serde_json::Value>,
}

/// Request body for `POST /sessions/{id}/files`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct UploadFileRequest {
    #[validate(length(min = 1, message = "filename cannot be empty"))]
    pub filename: String,
    pub content_base64: String,
}

/// Response body for a file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct UploadFileResponse {
    pub filename: String,
    pub size_bytes: u64,
}

/// Kind tag of one unit of observable interpreter activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Log,
    Display,
    Result,
    Error,
    Status,
    Artifact,
    Variables,
    /// Synthetic marker a capped hub emits in place of truncated history.
    Truncated,
}

/// One event on an execution's output stream.
///
/// Within an execution the `seq` numbers are strictly increasing and the
/// final event carries `terminal = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct OutputEvent {
    pub seq: u64,
    pub kind: OutputKind,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

impl OutputEvent {
    pub fn new(seq: u64, kind: OutputKind, payload: serde_json::Value) -> Self {
        Self { seq, kind, payload, terminal: false }
    }

    pub fn terminal(seq: u64, kind: OutputKind, payload: serde_json::Value) -> Self {
        Self { seq, kind, payload, terminal: true }
    }
}

/// A file produced by user code during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct Artifact {
    pub logical_name: String,
    pub mime_type: String,
    pub file_name: String,
}

/// A name added to the user namespace by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct SurfacedVariable {
    pub name: String,
    pub type_repr: String,
}

/// Log severity reported by extensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured log record emitted by an extension during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct LogEntry {
    pub level: LogLevel,
    pub tag: String,
    pub message: String,
}

/// Final aggregate of one execution round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct ExecutionResult {
    pub execution_id: String,
    pub code: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Text representation of the final expression value, if any.
    pub output: String,
    pub stdout_chunks: Vec<String>,
    pub stderr_chunks: Vec<String>,
    pub log_entries: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    pub surfaced_variables: Vec<SurfacedVariable>,
}

impl ExecutionResult {
    /// Empty accumulator for a fresh execution.
    pub fn new(execution_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            code: code.into(),
            success: true,
            error_message: None,
            output: String::new(),
            stdout_chunks: Vec::new(),
            stderr_chunks: Vec::new(),
            log_entries: Vec::new(),
            artifacts: Vec::new(),
            surfaced_variables: Vec::new(),
        }
    }

    /// Concatenated stdout as the caller would have seen it on a terminal.
    pub fn stdout(&self) -> String {
        self.stdout_chunks.concat()
    }

    /// Concatenated stderr.
    pub fn stderr(&self) -> String {
        self.stderr_chunks.concat()
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: u32,
}
