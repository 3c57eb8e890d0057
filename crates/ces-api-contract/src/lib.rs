//! Code execution service REST API contract types and validation
//!
//! This crate defines the schema types and validation for the REST API.
//! These types are shared between the server, the session runtime and
//! client implementations.

pub mod error;
pub mod types;
pub mod validation;

pub use error::*;
pub use types::*;

/// Generate OpenAPI schema for the API contract types
#[cfg(feature = "utoipa")]
pub fn openapi_schema() -> utoipa::openapi::OpenApi {
    use utoipa::OpenApi;
    #[derive(OpenApi)]
    #[openapi(
        info(title = "Code Execution Service REST API"),
        paths(),
        components(schemas(
            SessionStatus,
            SessionSummary,
            CreateSessionRequest,
            SessionListResponse,
            LoadExtensionRequest,
            ExecuteRequest,
            ExecuteAccepted,
            UpdateVariablesRequest,
            UploadFileRequest,
            UploadFileResponse,
            OutputKind,
            OutputEvent,
            Artifact,
            SurfacedVariable,
            LogLevel,
            LogEntry,
            ExecutionResult,
            HealthResponse,
            ProblemDetails
        ))
    )]
    struct ApiDoc;
    ApiDoc::openapi()
}
