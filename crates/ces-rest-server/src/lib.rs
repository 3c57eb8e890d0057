// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! REST API server for the code execution service.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod state;

pub use config::{RateLimitConfig, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::Server;
pub use state::AppState;
