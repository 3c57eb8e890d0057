//! Server configuration

use ces_core::RuntimeConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,

    /// Root directory for per-session working directories
    pub workspace_root: PathBuf,

    /// Shared secret expected in the `X-API-Key` header; `None` disables
    /// authentication
    pub api_key: Option<String>,

    /// Let requests from loopback peers bypass the API key check
    pub allow_loopback: bool,

    /// Enable permissive CORS headers for development
    pub enable_cors: bool,

    /// Interpreter command, e.g. `python3`
    pub interpreter_command: String,

    /// Extra arguments passed before the adapter script
    pub interpreter_args: Vec<String>,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,

    /// Per-execution budget for the user code phase
    pub exec_timeout: Duration,

    /// Idle session expiry; zero disables the sweep
    pub idle_timeout: Duration,

    /// Period of the idle sweep task
    pub sweep_interval: Duration,

    /// Budget for the interpreter readiness handshake
    pub startup_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8700".parse().unwrap(),
            workspace_root: PathBuf::from("workspace"),
            api_key: None,
            allow_loopback: true,
            enable_cors: false,
            interpreter_command: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            rate_limit: RateLimitConfig::default(),
            exec_timeout: Duration::from_secs(300),
            idle_timeout: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Derive the session runtime configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut runtime = RuntimeConfig::new(self.workspace_root.clone());
        runtime.exec_timeout = self.exec_timeout;
        runtime.idle_timeout = self.idle_timeout;
        runtime.sweep_interval = self.sweep_interval;
        runtime.startup_timeout = self.startup_timeout;
        runtime
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per minute per client
    pub requests_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
        }
    }
}
