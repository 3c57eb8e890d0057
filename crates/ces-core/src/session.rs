// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session aggregate and per-session serializer.
//!
//! Every mutating operation on a session goes through a single actor task
//! that owns the interpreter handle and drains an operation queue strictly
//! FIFO, so at most one operation touches the interpreter at a time and
//! executions within a session are totally ordered.

use crate::engine::{self, EngineConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::hub::StreamHub;
use crate::interpreter::{InterpreterHandle, InterpreterSpawner};
use crate::protocol::{Directive, InputFrame, KernelState, WireMessage};
use ces_api_contract::{ExecutionResult, SessionStatus, SessionSummary};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Depth of the per-session operation queue; senders briefly back off once
/// this many operations are waiting.
const OP_QUEUE_DEPTH: usize = 64;

/// A user-provided extension, immutable once registered.
#[derive(Debug, Clone)]
pub struct Extension {
    pub name: String,
    pub source: String,
    pub config: HashMap<String, String>,
}

/// Timing configuration a session inherits from the manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    pub idle_wait: Duration,
    pub kill_grace: Duration,
    pub startup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            idle_wait: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

struct Meta {
    status: SessionStatus,
    last_activity_at: DateTime<Utc>,
    execution_count: u64,
}

struct Executions {
    hubs: HashMap<String, Arc<StreamHub>>,
    used_ids: HashSet<String>,
}

/// State shared between the actor and every [`SessionRef`] clone.
pub struct SessionShared {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub cwd: PathBuf,
    meta: RwLock<Meta>,
    executions: Mutex<Executions>,
}

impl SessionShared {
    fn touch(&self) {
        self.meta.write().unwrap().last_activity_at = Utc::now();
    }

    fn set_status(&self, status: SessionStatus) {
        self.meta.write().unwrap().status = status;
    }
}

enum SessionOp {
    Execute {
        exec_id: String,
        code: String,
        hub: Arc<StreamHub>,
        reply: oneshot::Sender<RuntimeResult<ExecutionResult>>,
    },
    LoadExtension {
        extension: Extension,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    UpdateVariables {
        bindings: HashMap<String, Value>,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
}

/// Cheap handle to one session; cloned freely across HTTP requests.
#[derive(Clone)]
pub struct SessionRef {
    shared: Arc<SessionShared>,
    ops: mpsc::Sender<SessionOp>,
}

impl SessionRef {
    /// Boot a session: spawn its actor, which starts the interpreter and
    /// reports readiness through the returned receiver.
    pub fn spawn(
        id: String,
        cwd: PathBuf,
        spawner: Arc<dyn InterpreterSpawner>,
        config: SessionConfig,
    ) -> (Self, oneshot::Receiver<RuntimeResult<()>>) {
        let now = Utc::now();
        let shared = Arc::new(SessionShared {
            id: id.clone(),
            created_at: now,
            cwd,
            meta: RwLock::new(Meta {
                status: SessionStatus::Starting,
                last_activity_at: now,
                execution_count: 0,
            }),
            executions: Mutex::new(Executions {
                hubs: HashMap::new(),
                used_ids: HashSet::new(),
            }),
        });
        let (op_tx, op_rx) = mpsc::channel(OP_QUEUE_DEPTH);
        let (boot_tx, boot_rx) = oneshot::channel();

        let actor_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_actor(actor_shared, spawner, config, op_rx, boot_tx).await;
        });

        (
            Self {
                shared,
                ops: op_tx,
            },
            boot_rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.shared.cwd
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.meta.read().unwrap().status
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.shared.meta.read().unwrap().last_activity_at
    }

    pub fn summary(&self) -> SessionSummary {
        let meta = self.shared.meta.read().unwrap();
        SessionSummary {
            id: self.shared.id.clone(),
            created_at: self.shared.created_at,
            last_activity_at: meta.last_activity_at,
            execution_count: meta.execution_count,
            status: meta.status,
        }
    }

    /// Stream hub of a live or recently finished execution.
    pub fn execution_hub(&self, exec_id: &str) -> Option<Arc<StreamHub>> {
        self.shared.executions.lock().unwrap().hubs.get(exec_id).cloned()
    }

    /// Admit an execution: register its hub and enqueue the operation.
    ///
    /// The hub is registered before the operation is enqueued so a
    /// subscriber arriving right after a streaming accept always finds it.
    /// The returned receiver resolves once the execution finished.
    pub async fn execute(
        &self,
        exec_id: String,
        code: String,
    ) -> RuntimeResult<(Arc<StreamHub>, oneshot::Receiver<RuntimeResult<ExecutionResult>>)> {
        self.check_accepting()?;

        let hub = {
            let mut executions = self.shared.executions.lock().unwrap();
            if executions.used_ids.contains(&exec_id) {
                return Err(RuntimeError::DuplicateExecution(exec_id));
            }
            // Finished hubs are garbage-collected at the next admission.
            executions.hubs.retain(|_, hub| !hub.is_finished());
            let hub = StreamHub::new();
            executions.used_ids.insert(exec_id.clone());
            executions.hubs.insert(exec_id.clone(), Arc::clone(&hub));
            hub
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let op = SessionOp::Execute {
            exec_id,
            code,
            hub: Arc::clone(&hub),
            reply: reply_tx,
        };
        self.shared.touch();
        self.ops
            .send(op)
            .await
            .map_err(|_| RuntimeError::SessionStopped)?;
        Ok((hub, reply_rx))
    }

    pub async fn load_extension(&self, extension: Extension) -> RuntimeResult<()> {
        self.check_accepting()?;
        self.shared.touch();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(SessionOp::LoadExtension {
                extension,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::SessionStopped)?;
        reply_rx.await.map_err(|_| RuntimeError::SessionStopped)?
    }

    pub async fn update_variables(
        &self,
        bindings: HashMap<String, Value>,
    ) -> RuntimeResult<()> {
        self.check_accepting()?;
        self.shared.touch();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(SessionOp::UpdateVariables {
                bindings,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RuntimeError::SessionStopped)?;
        reply_rx.await.map_err(|_| RuntimeError::SessionStopped)?
    }

    /// Stop the session through the serializer. Safe to call more than
    /// once; a session that is already gone reports success.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .ops
            .send(SessionOp::Stop { reply: reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    fn check_accepting(&self) -> RuntimeResult<()> {
        match self.status() {
            SessionStatus::Stopping | SessionStatus::Stopped => {
                Err(RuntimeError::SessionStopped)
            }
            SessionStatus::Starting | SessionStatus::Running => Ok(()),
        }
    }
}

async fn run_actor(
    shared: Arc<SessionShared>,
    spawner: Arc<dyn InterpreterSpawner>,
    config: SessionConfig,
    mut ops: mpsc::Receiver<SessionOp>,
    boot_tx: oneshot::Sender<RuntimeResult<()>>,
) {
    let mut handle = match InterpreterHandle::start(
        spawner.as_ref(),
        &shared.id,
        &shared.cwd,
        config.startup_timeout,
    )
    .await
    {
        Ok(handle) => {
            shared.set_status(SessionStatus::Running);
            let _ = boot_tx.send(Ok(()));
            handle
        }
        Err(err) => {
            shared.set_status(SessionStatus::Stopped);
            let _ = boot_tx.send(Err(err));
            return;
        }
    };

    info!(session_id = %shared.id, pid = handle.pid(), "session started");

    let mut extensions: Vec<Extension> = Vec::new();
    let mut exec_index: u64 = 0;

    while let Some(op) = ops.recv().await {
        match op {
            SessionOp::Execute {
                exec_id,
                code,
                hub,
                reply,
            } => {
                exec_index += 1;
                let result = engine::run_execution(
                    &config.engine,
                    &mut handle,
                    &hub,
                    &shared.cwd,
                    &exec_id,
                    exec_index,
                    &code,
                )
                .await;
                {
                    let mut meta = shared.meta.write().unwrap();
                    meta.execution_count += 1;
                    meta.last_activity_at = Utc::now();
                }
                if handle.is_exited() {
                    // A dead interpreter ends the session; the registry
                    // entry stays so the client can observe the status.
                    shared.set_status(SessionStatus::Stopped);
                    warn!(session_id = %shared.id, exec_id, "interpreter died during execution");
                }
                let _ = reply.send(result);
            }
            SessionOp::LoadExtension { extension, reply } => {
                let result = if handle.is_exited() {
                    Err(RuntimeError::PeerGone)
                } else {
                    load_extension(&mut handle, &config, &extension).await
                };
                if result.is_ok() {
                    extensions.push(extension);
                }
                if handle.is_exited() {
                    shared.set_status(SessionStatus::Stopped);
                }
                shared.touch();
                let _ = reply.send(result);
            }
            SessionOp::UpdateVariables { bindings, reply } => {
                let result = if handle.is_exited() {
                    Err(RuntimeError::PeerGone)
                } else {
                    update_variables(&mut handle, &config, bindings).await
                };
                if handle.is_exited() {
                    shared.set_status(SessionStatus::Stopped);
                }
                shared.touch();
                let _ = reply.send(result);
            }
            SessionOp::Stop { reply } => {
                shared.set_status(SessionStatus::Stopping);
                handle.kill(config.kill_grace).await;
                if let Err(err) = tokio::fs::remove_dir_all(&shared.cwd).await {
                    debug!(session_id = %shared.id, error = %err, "cwd removal failed");
                }
                shared.set_status(SessionStatus::Stopped);
                info!(session_id = %shared.id, "session stopped");
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }

    // Anything still queued (or sent while we were stopping) fails fast.
    ops.close();
    while let Ok(op) = ops.try_recv() {
        match op {
            SessionOp::Execute { reply, hub, .. } => {
                let _ = hub.publish(ces_api_contract::OutputEvent::terminal(
                    0,
                    ces_api_contract::OutputKind::Error,
                    serde_json::json!({ "message": "session stopped" }),
                ));
                let _ = reply.send(Err(RuntimeError::SessionStopped));
            }
            SessionOp::LoadExtension { reply, .. } => {
                let _ = reply.send(Err(RuntimeError::SessionStopped));
            }
            SessionOp::UpdateVariables { reply, .. } => {
                let _ = reply.send(Err(RuntimeError::SessionStopped));
            }
            SessionOp::Stop { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Register-then-load round-trip. The extension set is only updated by the
/// caller when this returns `Ok`, so a failing load leaves the session's
/// extension set unchanged.
async fn load_extension(
    handle: &mut InterpreterHandle,
    config: &SessionConfig,
    extension: &Extension,
) -> RuntimeResult<()> {
    handle
        .submit(InputFrame::ctrl(Directive::ExtRegister {
            name: extension.name.clone(),
            source: extension.source.clone(),
        }))
        .await?;
    if let Some(error) = await_idle_collecting_error(handle, config.idle_wait).await? {
        return Err(RuntimeError::ExtensionFailed(error));
    }

    handle
        .submit(InputFrame::ctrl(Directive::ExtLoad {
            name: extension.name.clone(),
            config: extension.config.clone(),
        }))
        .await?;
    if let Some(error) = await_idle_collecting_error(handle, config.idle_wait).await? {
        return Err(RuntimeError::ExtensionFailed(error));
    }
    Ok(())
}

async fn update_variables(
    handle: &mut InterpreterHandle,
    config: &SessionConfig,
    bindings: HashMap<String, Value>,
) -> RuntimeResult<()> {
    handle
        .submit(InputFrame::ctrl(Directive::VarUpdate { bindings }))
        .await?;
    handle.await_idle(config.idle_wait).await
}

/// Wait for the idle acknowledgement of a directive, capturing an error
/// frame the adapter may emit first.
async fn await_idle_collecting_error(
    handle: &mut InterpreterHandle,
    budget: Duration,
) -> RuntimeResult<Option<String>> {
    let deadline = tokio::time::Instant::now() + budget;
    let mut error: Option<String> = None;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(RuntimeError::Timeout);
        }
        match handle.next_event(remaining).await? {
            WireMessage::Status {
                state: KernelState::Idle,
            } => return Ok(error),
            WireMessage::Error { ename, evalue, .. } => {
                error = Some(format!("{}: {}", ename, evalue));
            }
            _ => {}
        }
    }
}
