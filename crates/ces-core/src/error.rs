//! Runtime error taxonomy

use thiserror::Error;

/// Result alias used throughout the session runtime.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors produced by the session runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("execution id already used: {0}")]
    DuplicateExecution(String),

    #[error("interpreter failed to start: {0}")]
    StartupFailed(String),

    #[error("interpreter exited unexpectedly")]
    PeerGone,

    #[error("operation timed out")]
    Timeout,

    #[error("session is stopped")]
    SessionStopped,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("extension load failed: {0}")]
    ExtensionFailed(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
