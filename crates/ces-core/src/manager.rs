// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-wide session registry.

use crate::error::{RuntimeError, RuntimeResult};
use crate::interpreter::InterpreterSpawner;
use crate::session::{SessionConfig, SessionRef};
use ces_api_contract::{validation, SessionStatus, SessionSummary};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Runtime configuration shared by every session.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root under which each session gets its working directory.
    pub workspace_root: PathBuf,
    /// Budget for the interpreter readiness handshake.
    pub startup_timeout: Duration,
    /// Per-execution budget for the user code phase.
    pub exec_timeout: Duration,
    /// Budget for one control round-trip.
    pub idle_wait: Duration,
    /// Window the interpreter gets to come back after an interrupt.
    pub interrupt_grace: Duration,
    /// Orderly-shutdown window before a forced kill.
    pub kill_grace: Duration,
    /// Sessions idle longer than this are swept; zero disables the sweep.
    pub idle_timeout: Duration,
    /// Period of the idle sweep task.
    pub sweep_interval: Duration,
    /// Per-session deadline during service shutdown.
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            startup_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(300),
            idle_wait: Duration::from_secs(30),
            interrupt_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            idle_timeout: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            engine: crate::engine::EngineConfig {
                exec_timeout: self.exec_timeout,
                idle_wait: self.idle_wait,
                interrupt_grace: self.interrupt_grace,
            },
            idle_wait: self.idle_wait,
            kill_grace: self.kill_grace,
            startup_timeout: self.startup_timeout,
        }
    }
}

/// Registry mapping session id to live session.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionRef>>,
    spawner: Arc<dyn InterpreterSpawner>,
    config: RuntimeConfig,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn new(config: RuntimeConfig, spawner: Arc<dyn InterpreterSpawner>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            spawner,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a session, minting an id when the caller did not supply one.
    ///
    /// On any failure during interpreter startup the working directory is
    /// rolled back and the startup error is returned.
    pub async fn create(&self, session_id: Option<String>) -> RuntimeResult<SessionSummary> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }

        let id = match session_id {
            Some(id) => {
                validation::validate_session_id(&id)
                    .map_err(|err| RuntimeError::BadRequest(err.to_string()))?;
                id
            }
            None => uuid::Uuid::new_v4().simple().to_string(),
        };

        let cwd = self.config.workspace_root.join(&id);
        let (session, boot_rx) = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                return Err(RuntimeError::AlreadyExists(id));
            }
            std::fs::create_dir_all(&cwd)?;
            let (session, boot_rx) = SessionRef::spawn(
                id.clone(),
                cwd.clone(),
                Arc::clone(&self.spawner),
                self.config.session_config(),
            );
            sessions.insert(id.clone(), session.clone());
            (session, boot_rx)
        };

        match boot_rx.await {
            Ok(Ok(())) => Ok(session.summary()),
            Ok(Err(err)) => {
                self.sessions.write().await.remove(&id);
                let _ = std::fs::remove_dir_all(&cwd);
                Err(err)
            }
            Err(_) => {
                self.sessions.write().await.remove(&id);
                let _ = std::fs::remove_dir_all(&cwd);
                Err(RuntimeError::StartupFailed(
                    "session actor died during startup".to_string(),
                ))
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> RuntimeResult<SessionRef> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(session_id.to_string()))
    }

    /// Metadata snapshot of every registered session.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut items: Vec<SessionSummary> = sessions.values().map(|s| s.summary()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.status() != SessionStatus::Stopped)
            .count()
    }

    /// Stop a session through its serializer and deregister it.
    pub async fn delete(&self, session_id: &str) -> RuntimeResult<()> {
        let session = self.get(session_id).await?;
        session.stop().await?;
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    /// Delete every session whose last activity is older than the idle
    /// timeout. No-op while the timeout is disabled.
    pub async fn sweep(&self) {
        if self.config.idle_timeout.is_zero() {
            return;
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let idle_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.last_activity_at() < cutoff)
                .map(|s| s.id().to_string())
                .collect()
        };
        for id in idle_ids {
            info!(session_id = %id, "sweeping idle session");
            if let Err(err) = self.delete(&id).await {
                warn!(session_id = %id, error = %err, "idle sweep failed");
            }
        }
    }

    /// Spawn the periodic idle sweep task; it exits once the manager shuts
    /// down.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if manager.closed.load(Ordering::SeqCst) {
                    break;
                }
                manager.sweep().await;
            }
        })
    }

    /// Stop accepting sessions and tear down the existing ones in parallel.
    ///
    /// Each stop gets a bounded deadline; the interpreter handle's own
    /// grace escalation provides the forced kill for stragglers.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        info!(count = ids.len(), "shutting down sessions");

        let deletions = ids.into_iter().map(|id| async move {
            match tokio::time::timeout(self.config.shutdown_grace, self.delete(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(session_id = %id, error = %err, "shutdown stop failed"),
                Err(_) => error!(session_id = %id, "session did not stop within the deadline"),
            }
        });
        futures::future::join_all(deletions).await;
    }
}
