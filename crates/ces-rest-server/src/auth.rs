//! Authentication middleware
//!
//! A single shared secret in the `X-API-Key` header. Health and schema
//! endpoints stay open, and loopback peers may bypass the check when the
//! configuration allows it.

use crate::error::ServerError;
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

const API_KEY_HEADER: &str = "x-api-key";

pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/openapi.json" {
        return next.run(req).await;
    }

    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(req).await;
    };

    if state.config.allow_loopback {
        if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            if peer.ip().is_loopback() {
                return next.run(req).await;
            }
        }
    }

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    match provided {
        Some(key) if key == expected => next.run(req).await,
        _ => ServerError::Auth("missing or invalid API key".to_string()).into_response(),
    }
}
