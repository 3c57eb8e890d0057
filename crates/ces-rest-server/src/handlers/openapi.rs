//! OpenAPI schema endpoint

use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Code Execution Service REST API",
        description = "Isolated, long-lived, stateful code execution sessions over HTTP"
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::sessions::list_sessions,
        crate::handlers::sessions::create_session,
        crate::handlers::sessions::get_session,
        crate::handlers::sessions::delete_session,
        crate::handlers::execute::execute,
        crate::handlers::execute::stream_execution,
        crate::handlers::execute::load_extension,
        crate::handlers::execute::update_variables,
        crate::handlers::files::upload_file,
        crate::handlers::files::download_artifact,
    )
)]
struct ApiDoc;

/// Serve the generated OpenAPI document, merged with the contract schemas.
pub async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    let mut spec = ApiDoc::openapi();
    spec.merge(ces_api_contract::openapi_schema());
    Json(spec)
}
