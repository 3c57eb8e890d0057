// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Main server implementation

use crate::auth::auth_middleware;
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handlers;
use crate::middleware::{rate_limit_middleware, RequestBudget};
use crate::state::AppState;
use axum::{
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use ces_core::{InterpreterSpawner, PythonSpawner, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

/// REST API server
pub struct Server {
    config: ServerConfig,
    app: Router,
    manager: Arc<SessionManager>,
}

impl Server {
    /// Create a server that launches real interpreter subprocesses.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        std::fs::create_dir_all(&config.workspace_root)?;
        let spawner = PythonSpawner::new(
            &config.workspace_root,
            config.interpreter_command.clone(),
            config.interpreter_args.clone(),
        )?;
        Self::with_spawner(config, Arc::new(spawner))
    }

    /// Create a server against an arbitrary spawner; tests wire the mock
    /// interpreter through here.
    pub fn with_spawner(
        config: ServerConfig,
        spawner: Arc<dyn InterpreterSpawner>,
    ) -> ServerResult<Self> {
        let state = AppState::new(config.clone(), spawner)?;
        let manager = Arc::clone(&state.manager);
        let app = Self::build_app(state, &config);
        Ok(Self {
            config,
            app,
            manager,
        })
    }

    /// Build the Axum application with routes and middleware
    fn build_app(state: AppState, config: &ServerConfig) -> Router {
        let middleware_stack = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(from_fn({
                let budget = Arc::new(RequestBudget::new(config.rate_limit.clone()));
                move |req, next| {
                    let budget = Arc::clone(&budget);
                    rate_limit_middleware(budget, req, next)
                }
            }))
            .layer({
                if config.enable_cors {
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any)
                } else {
                    CorsLayer::new()
                        .allow_origin(vec![
                            HeaderValue::from_static("http://localhost:3000"),
                            HeaderValue::from_static("http://127.0.0.1:3000"),
                        ])
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::DELETE,
                        ])
                        .allow_headers([
                            axum::http::header::AUTHORIZATION,
                            axum::http::header::CONTENT_TYPE,
                        ])
                }
            });

        let api_routes = Router::new()
            // Health
            .route("/health", get(handlers::health::health))
            // Session management
            .route(
                "/sessions",
                get(handlers::sessions::list_sessions).post(handlers::sessions::create_session),
            )
            .route(
                "/sessions/{id}",
                get(handlers::sessions::get_session).delete(handlers::sessions::delete_session),
            )
            // Execution
            .route("/sessions/{id}/execute", post(handlers::execute::execute))
            .route(
                "/sessions/{id}/execute/{exec_id}/stream",
                get(handlers::execute::stream_execution),
            )
            .route(
                "/sessions/{id}/plugins",
                post(handlers::execute::load_extension),
            )
            .route(
                "/sessions/{id}/variables",
                post(handlers::execute::update_variables),
            )
            // Files and artifacts
            .route("/sessions/{id}/files", post(handlers::files::upload_file))
            .route(
                "/sessions/{id}/artifacts/{file}",
                get(handlers::files::download_artifact),
            )
            .layer(from_fn_with_state(state.clone(), auth_middleware));

        Router::new()
            .nest("/api/v1", api_routes)
            .route("/openapi.json", get(handlers::openapi::openapi_spec))
            .with_state(state)
            .layer(middleware_stack)
    }

    /// The session registry backing this server.
    pub fn manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.manager)
    }

    /// Get the bind address
    pub fn addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server until ctrl-c, then tear down every session.
    pub async fn run(self) -> ServerResult<()> {
        let addr = self.config.bind_addr;
        info!("Starting server on {}", addr);

        let sweeper = self.manager.spawn_sweeper();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

        self.manager.shutdown().await;
        sweeper.abort();
        Ok(())
    }
}
