// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interpreter supervision.
//!
//! [`InterpreterHandle`] owns one interpreter for the lifetime of a session
//! and exposes an ordered request/response channel to it. The subprocess
//! itself sits behind the [`InterpreterProcess`] trait so tests can run the
//! whole runtime against an in-memory interpreter.

use crate::error::{RuntimeError, RuntimeResult};
use crate::protocol::{decode_wire_line, Directive, InputFrame, KernelState, WireMessage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// The control adapter pre-loaded into every Python interpreter.
pub const ADAPTER_SOURCE: &str = include_str!("../adapter/adapter.py");

/// A running interpreter's raw I/O channels.
#[async_trait]
pub trait InterpreterProcess: Send {
    /// OS process id, if the interpreter is a real subprocess.
    fn pid(&self) -> Option<u32>;

    /// Write one protocol line to the interpreter's input.
    async fn write_line(&mut self, line: &str) -> std::io::Result<()>;

    /// Read the next structured message; `None` means the output channel
    /// closed (the peer is gone).
    async fn read_message(&mut self) -> Option<WireMessage>;

    /// Deliver an interrupt to the interpreter (SIGINT for subprocesses).
    fn interrupt(&mut self);

    /// Orderly termination escalating to a forced kill after `grace`.
    async fn kill(&mut self, grace: Duration);
}

/// Factory for interpreter processes; the seam between the session runtime
/// and the concrete interpreter.
#[async_trait]
pub trait InterpreterSpawner: Send + Sync {
    async fn spawn(
        &self,
        session_id: &str,
        cwd: &Path,
    ) -> RuntimeResult<Box<dyn InterpreterProcess>>;
}

/// Spawns `python3 -u <adapter.py>` with the session cwd as working
/// directory. The adapter script is materialized once under
/// `<workspace_root>/.runtime/`.
pub struct PythonSpawner {
    command: String,
    args: Vec<String>,
    adapter_path: PathBuf,
}

impl PythonSpawner {
    pub fn new(
        workspace_root: &Path,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> std::io::Result<Self> {
        let runtime_dir = workspace_root.join(".runtime");
        std::fs::create_dir_all(&runtime_dir)?;
        let adapter_path = runtime_dir.join("adapter.py");
        std::fs::write(&adapter_path, ADAPTER_SOURCE)?;
        Ok(Self {
            command: command.into(),
            args,
            adapter_path,
        })
    }
}

#[async_trait]
impl InterpreterSpawner for PythonSpawner {
    async fn spawn(
        &self,
        session_id: &str,
        cwd: &Path,
    ) -> RuntimeResult<Box<dyn InterpreterProcess>> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(&self.adapter_path)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                RuntimeError::StartupFailed(format!(
                    "failed to launch {}: {}",
                    self.command, err
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::StartupFailed("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::StartupFailed("no stdout pipe".to_string()))?;

        debug!(session_id, pid = child.id(), "interpreter spawned");

        Ok(Box::new(ProcessInterpreter {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            exited: false,
        }))
    }
}

struct ProcessInterpreter {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    exited: bool,
}

#[async_trait]
impl InterpreterProcess for ProcessInterpreter {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "interpreter stdin closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn read_message(&mut self) -> Option<WireMessage> {
        if self.exited {
            return None;
        }
        match self.lines.next_line().await {
            Ok(Some(line)) => Some(decode_wire_line(&line)),
            Ok(None) => {
                self.exited = true;
                None
            }
            Err(err) => {
                warn!(error = %err, "interpreter output channel broke");
                self.exited = true;
                None
            }
        }
    }

    fn interrupt(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
    }

    async fn kill(&mut self, grace: Duration) {
        // Closing stdin asks the adapter to exit on EOF.
        self.stdin.take();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        self.exited = true;
    }
}

/// Supervisor around one interpreter process.
///
/// A broken output channel is terminal: the first detection flips the handle
/// to exited, and every later operation fails fast with `PeerGone`.
pub struct InterpreterHandle {
    process: Box<dyn InterpreterProcess>,
    exited: bool,
    killed: bool,
}

impl InterpreterHandle {
    /// Boot an interpreter for a session: spawn, wait for the readiness
    /// handshake, then establish session identity. Failure here is fatal to
    /// the session.
    pub async fn start(
        spawner: &dyn InterpreterSpawner,
        session_id: &str,
        cwd: &Path,
        startup_timeout: Duration,
    ) -> RuntimeResult<Self> {
        let process = spawner.spawn(session_id, cwd).await?;
        let mut handle = Self {
            process,
            exited: false,
            killed: false,
        };

        handle
            .await_idle(startup_timeout)
            .await
            .map_err(|err| startup_error("readiness handshake", startup_timeout, err))?;

        handle
            .submit(InputFrame::ctrl(Directive::SessionInit {
                session_id: session_id.to_string(),
                cwd: cwd.to_string_lossy().into_owned(),
            }))
            .await
            .map_err(|err| startup_error("session-init", startup_timeout, err))?;
        handle
            .await_idle(startup_timeout)
            .await
            .map_err(|err| startup_error("session-init", startup_timeout, err))?;

        Ok(handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    /// Write one payload (code or directive) to the interpreter.
    pub async fn submit(&mut self, frame: InputFrame) -> RuntimeResult<()> {
        if self.exited {
            return Err(RuntimeError::PeerGone);
        }
        if let Err(err) = self.process.write_line(&frame.encode()).await {
            debug!(error = %err, "interpreter input write failed");
            self.exited = true;
            return Err(RuntimeError::PeerGone);
        }
        Ok(())
    }

    /// Read the next output message, waiting at most `deadline`.
    pub async fn next_event(&mut self, deadline: Duration) -> RuntimeResult<WireMessage> {
        if self.exited {
            return Err(RuntimeError::PeerGone);
        }
        match tokio::time::timeout(deadline, self.process.read_message()).await {
            Err(_) => Err(RuntimeError::Timeout),
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                self.exited = true;
                Err(RuntimeError::PeerGone)
            }
        }
    }

    /// Consume messages until the next `status: idle` acknowledgement.
    pub async fn await_idle(&mut self, budget: Duration) -> RuntimeResult<()> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RuntimeError::Timeout);
            }
            if let WireMessage::Status {
                state: KernelState::Idle,
            } = self.next_event(remaining).await?
            {
                return Ok(());
            }
        }
    }

    /// Deliver an interrupt to the interpreter.
    pub fn interrupt(&mut self) {
        self.process.interrupt();
    }

    /// Orderly shutdown escalating to a forced kill after `grace`.
    /// Idempotent.
    pub async fn kill(&mut self, grace: Duration) {
        if self.killed {
            return;
        }
        self.killed = true;
        if !self.exited {
            let _ = self
                .process
                .write_line(&InputFrame::ctrl(Directive::Shutdown).encode())
                .await;
        }
        self.process.kill(grace).await;
        self.exited = true;
    }
}

fn startup_error(stage: &str, timeout: Duration, err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::Timeout => RuntimeError::StartupFailed(format!(
            "{} did not complete within {:?}",
            stage, timeout
        )),
        RuntimeError::PeerGone => {
            RuntimeError::StartupFailed(format!("interpreter exited during {}", stage))
        }
        other => other,
    }
}
