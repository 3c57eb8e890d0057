//! Server state management

use crate::config::ServerConfig;
use ces_core::{InterpreterSpawner, SessionManager};
use std::sync::Arc;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    /// Process-wide session registry
    pub manager: Arc<SessionManager>,

    /// Server configuration
    pub config: ServerConfig,
}

impl AppState {
    /// Create new app state backed by the given interpreter spawner.
    pub fn new(
        config: ServerConfig,
        spawner: Arc<dyn InterpreterSpawner>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.workspace_root)?;
        let manager = SessionManager::new(config.runtime_config(), spawner);
        Ok(Self { manager, config })
    }
}
