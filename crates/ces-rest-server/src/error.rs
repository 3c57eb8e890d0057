//! Server error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ces_api_contract::{ApiContractError, ProblemDetails};
use ces_core::RuntimeError;

/// Server result type
pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Contract error: {0}")]
    Contract(#[from] ApiContractError),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Convert error to Problem+JSON response
    pub fn to_problem(&self) -> ProblemDetails {
        match self {
            ServerError::Runtime(err) => runtime_problem(err),
            ServerError::Contract(err) => ProblemDetails::new(
                "https://docs.example.com/errors/bad-request",
                "Bad Request",
                StatusCode::BAD_REQUEST.as_u16(),
                err.to_string(),
            ),
            ServerError::Validation(err) => ProblemDetails::new(
                "https://docs.example.com/errors/validation",
                "Validation Error",
                StatusCode::BAD_REQUEST.as_u16(),
                err.to_string(),
            ),
            ServerError::Auth(msg) => ProblemDetails::new(
                "https://docs.example.com/errors/auth",
                "Authentication Failed",
                StatusCode::UNAUTHORIZED.as_u16(),
                msg.clone(),
            ),
            ServerError::NotFound(what) => ProblemDetails::new(
                "https://docs.example.com/errors/not-found",
                "Not Found",
                StatusCode::NOT_FOUND.as_u16(),
                what.clone(),
            ),
            ServerError::BadRequest(msg) => ProblemDetails::new(
                "https://docs.example.com/errors/bad-request",
                "Bad Request",
                StatusCode::BAD_REQUEST.as_u16(),
                msg.clone(),
            ),
            ServerError::RateLimited => ProblemDetails::new(
                "https://docs.example.com/errors/rate-limited",
                "Rate Limited",
                StatusCode::TOO_MANY_REQUESTS.as_u16(),
                "Too many requests".to_string(),
            ),
            ServerError::Internal(msg) => ProblemDetails::new(
                "https://docs.example.com/errors/internal",
                "Internal Server Error",
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                msg.clone(),
            ),
        }
    }
}

fn runtime_problem(err: &RuntimeError) -> ProblemDetails {
    match err {
        RuntimeError::NotFound(id) => ProblemDetails::new(
            "https://docs.example.com/errors/not-found",
            "Session Not Found",
            StatusCode::NOT_FOUND.as_u16(),
            format!("Session with ID '{}' not found", id),
        ),
        RuntimeError::AlreadyExists(id) => ProblemDetails::new(
            "https://docs.example.com/errors/conflict",
            "Session Already Exists",
            StatusCode::CONFLICT.as_u16(),
            format!("Session with ID '{}' already exists", id),
        ),
        RuntimeError::DuplicateExecution(id) => ProblemDetails::new(
            "https://docs.example.com/errors/conflict",
            "Duplicate Execution",
            StatusCode::CONFLICT.as_u16(),
            format!("Execution ID '{}' was already used in this session", id),
        ),
        RuntimeError::SessionStopped => ProblemDetails::new(
            "https://docs.example.com/errors/conflict",
            "Session Stopped",
            StatusCode::CONFLICT.as_u16(),
            "The session has stopped and no longer accepts operations".to_string(),
        ),
        RuntimeError::ShuttingDown => ProblemDetails::new(
            "https://docs.example.com/errors/unavailable",
            "Service Shutting Down",
            StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            "The service is shutting down".to_string(),
        ),
        RuntimeError::StartupFailed(detail) => ProblemDetails::new(
            "https://docs.example.com/errors/interpreter",
            "Interpreter Startup Failed",
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail.clone(),
        ),
        RuntimeError::BadRequest(msg) => ProblemDetails::new(
            "https://docs.example.com/errors/bad-request",
            "Bad Request",
            StatusCode::BAD_REQUEST.as_u16(),
            msg.clone(),
        ),
        RuntimeError::ExtensionFailed(detail) => ProblemDetails::new(
            "https://docs.example.com/errors/extension",
            "Extension Load Failed",
            StatusCode::BAD_REQUEST.as_u16(),
            detail.clone(),
        ),
        RuntimeError::PeerGone
        | RuntimeError::Timeout
        | RuntimeError::Internal(_)
        | RuntimeError::Io(_) => ProblemDetails::new(
            "https://docs.example.com/errors/internal",
            "Internal Server Error",
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            err.to_string(),
        ),
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let problem = self.to_problem();
        let status = StatusCode::from_u16(problem.status.unwrap_or(500))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

/// Convert IO errors
impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(format!("IO error: {}", err))
    }
}
