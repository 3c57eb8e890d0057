//! Request throttling.
//!
//! Each caller gets a fixed one-minute request budget per session it talks
//! to, so a client hammering one session (streaming reconnect loops are the
//! usual culprit) does not starve its other sessions or other tenants.

use crate::config::RateLimitConfig;
use crate::error::ServerError;
use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    opened_at: Instant,
    spent: u64,
}

/// Fixed-window request budgets, one window per caller key.
pub struct RequestBudget {
    limit: u64,
    windows: Mutex<HashMap<String, Window>>,
}

impl RequestBudget {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limit: config.requests_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Charge one request against `key`; false once the window is spent.
    pub async fn try_charge(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        // Stale windows are dropped on every charge, which keeps the map
        // bounded by the set of callers seen in the last minute.
        windows.retain(|_, window| now.duration_since(window.opened_at) < WINDOW);

        let window = windows.entry(key.to_string()).or_insert(Window {
            opened_at: now,
            spent: 0,
        });
        if window.spent < self.limit {
            window.spent += 1;
            true
        } else {
            false
        }
    }
}

pub async fn rate_limit_middleware(
    budget: Arc<RequestBudget>,
    req: Request,
    next: Next,
) -> Response {
    let key = budget_key(&req);
    if budget.try_charge(&key).await {
        next.run(req).await
    } else {
        ServerError::RateLimited.into_response()
    }
}

/// Budget key: caller identity, scoped by the session the request targets.
///
/// The caller is the first hop of `x-forwarded-for` when a proxy supplied
/// one, otherwise the peer address of the connection. Requests under
/// `/api/v1/sessions/{id}/...` are additionally keyed by that id.
fn budget_key(req: &Request) -> String {
    let caller = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|header| header.to_str().ok())
        .and_then(|hops| hops.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(peer)| peer.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    match session_segment(req.uri().path()) {
        Some(session_id) => format!("{}/{}", caller, session_id),
        None => caller,
    }
}

fn session_segment(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/v1/sessions/")?;
    let id = rest.split('/').next()?;
    if id.is_empty() { None } else { Some(id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_runs_out_within_the_window() {
        let budget = RequestBudget::new(RateLimitConfig {
            requests_per_minute: 2,
        });
        assert!(budget.try_charge("10.0.0.1").await);
        assert!(budget.try_charge("10.0.0.1").await);
        assert!(!budget.try_charge("10.0.0.1").await);
        // An unrelated caller has its own window.
        assert!(budget.try_charge("10.0.0.2").await);
    }

    #[test]
    fn session_routes_extend_the_key() {
        assert_eq!(session_segment("/api/v1/sessions/s1/execute"), Some("s1"));
        assert_eq!(session_segment("/api/v1/sessions/s1"), Some("s1"));
        assert_eq!(session_segment("/api/v1/sessions"), None);
        assert_eq!(session_segment("/api/v1/health"), None);
    }
}
