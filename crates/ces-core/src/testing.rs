// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory mock interpreter for tests.
//!
//! The mock speaks the full control protocol but executes a scripted
//! mini-language instead of Python, so the session runtime and the HTTP
//! layer can be exercised end-to-end without an interpreter binary:
//!
//! - `print <text>`: emit a stdout chunk
//! - `set <name> <value>`: bind a variable (int/float/str inferred)
//! - `getvar <name>`: print a bound variable or raise NameError
//! - `expr <text>`: report an expression result
//! - `log <level> <tag> <text>`: emit a sentinel-framed log record
//! - `write <file> <content>`: write a real file into the session cwd
//! - `display <mime> <base64>`: emit a rich display payload
//! - `sleep <millis>`: stall mid-execution
//! - `raise <message>`: raise an error
//! - `exit`: die abruptly (peer gone)

use crate::error::{RuntimeError, RuntimeResult};
use crate::interpreter::{InterpreterProcess, InterpreterSpawner};
use crate::protocol::{
    Directive, InputFrame, KernelState, ReplyStatus, StreamName, WireMessage, LOG_SENTINEL,
};
use async_trait::async_trait;
use ces_api_contract::SurfacedVariable;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Spawner producing one in-memory mock interpreter per session.
#[derive(Default)]
pub struct MockSpawner;

#[async_trait]
impl InterpreterSpawner for MockSpawner {
    async fn spawn(
        &self,
        _session_id: &str,
        cwd: &Path,
    ) -> RuntimeResult<Box<dyn InterpreterProcess>> {
        let (input_tx, input_rx) = mpsc::channel::<String>(64);
        let (output_tx, output_rx) = mpsc::channel::<WireMessage>(4096);
        tokio::spawn(run_mock_kernel(input_rx, output_tx, cwd.to_path_buf()));
        Ok(Box::new(MockProcess {
            input_tx: Some(input_tx),
            output_rx,
        }))
    }
}

/// A spawner that refuses to start, for exercising startup failures.
pub struct FailingSpawner;

#[async_trait]
impl InterpreterSpawner for FailingSpawner {
    async fn spawn(
        &self,
        _session_id: &str,
        _cwd: &Path,
    ) -> RuntimeResult<Box<dyn InterpreterProcess>> {
        Err(RuntimeError::StartupFailed(
            "mock interpreter refused to start".to_string(),
        ))
    }
}

struct MockProcess {
    input_tx: Option<mpsc::Sender<String>>,
    output_rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl InterpreterProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let tx = self.input_tx.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mock stdin closed")
        })?;
        tx.send(line.to_string()).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mock kernel gone")
        })
    }

    async fn read_message(&mut self) -> Option<WireMessage> {
        self.output_rx.recv().await
    }

    fn interrupt(&mut self) {}

    async fn kill(&mut self, _grace: Duration) {
        self.input_tx.take();
        self.output_rx.close();
    }
}

struct MockKernel {
    out: mpsc::Sender<WireMessage>,
    cwd: PathBuf,
    vars: BTreeMap<String, (String, String)>,
    baseline: HashSet<String>,
    registry: HashMap<String, String>,
    watermark: SystemTime,
}

impl MockKernel {
    async fn emit(&self, message: WireMessage) -> bool {
        self.out.send(message).await.is_ok()
    }

    async fn idle(&self) -> bool {
        self.emit(WireMessage::Status {
            state: KernelState::Idle,
        })
        .await
    }

    async fn stdout(&self, text: impl Into<String>) -> bool {
        self.emit(WireMessage::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        })
        .await
    }

    async fn error(&self, ename: &str, evalue: &str) -> bool {
        self.emit(WireMessage::Error {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback: vec![
                "Traceback (most recent call last):\n".to_string(),
                format!("{}: {}\n", ename, evalue),
            ],
        })
        .await
    }

    async fn handle_directive(&mut self, directive: Directive) -> bool {
        match directive {
            Directive::SessionInit { .. } => {
                self.baseline = self.vars.keys().cloned().collect();
                self.watermark = SystemTime::now();
                self.idle().await
            }
            Directive::ExtRegister { name, source } => {
                self.registry.insert(name, source);
                self.idle().await
            }
            Directive::ExtLoad { name, .. } => {
                match self.registry.get(&name) {
                    None => {
                        self.error("KeyError", &format!("extension not registered: {}", name))
                            .await;
                    }
                    Some(source) if source.starts_with("fail") => {
                        let detail = source.strip_prefix("fail").unwrap_or("").trim();
                        self.error("RuntimeError", &format!("load failed: {}", detail))
                            .await;
                    }
                    Some(_) => {
                        self.vars
                            .insert(name.clone(), ("<extension>".to_string(), "Extension".to_string()));
                        self.baseline.insert(name);
                    }
                }
                self.idle().await
            }
            Directive::PreExec { .. } => self.idle().await,
            Directive::PostExec { .. } => {
                let items: Vec<SurfacedVariable> = self
                    .vars
                    .iter()
                    .filter(|(name, _)| !self.baseline.contains(*name) && !name.starts_with('_'))
                    .map(|(name, (_, type_repr))| SurfacedVariable {
                        name: name.clone(),
                        type_repr: type_repr.clone(),
                    })
                    .collect();
                if !self
                    .emit(WireMessage::Variables { items })
                    .await
                {
                    return false;
                }
                self.scan_artifacts().await;
                self.watermark = SystemTime::now();
                self.baseline = self.vars.keys().cloned().collect();
                self.idle().await
            }
            Directive::VarUpdate { bindings } => {
                for (name, value) in bindings {
                    let (repr, type_repr) = json_binding(&value);
                    self.vars.insert(name.clone(), (repr, type_repr));
                    self.baseline.insert(name);
                }
                self.idle().await
            }
            Directive::Shutdown => false,
        }
    }

    async fn scan_artifacts(&self) {
        let Ok(entries) = std::fs::read_dir(&self.cwd) else {
            return;
        };
        let mut names: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    return None;
                }
                Some((name, entry.path()))
            })
            .collect();
        names.sort();
        for (name, path) in names {
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let fresh = meta
                .modified()
                .map(|mtime| mtime > self.watermark)
                .unwrap_or(false);
            if fresh {
                let _ = self
                    .emit(WireMessage::Artifact {
                        file_name: name,
                        mime_type: crate::artifacts::mime_for_path(&path).to_string(),
                    })
                    .await;
            }
        }
    }

    async fn run_code(&mut self, code: &str) -> bool {
        if !self
            .emit(WireMessage::Status {
                state: KernelState::Busy,
            })
            .await
        {
            return false;
        }
        let mut failed = false;
        'lines: for line in code.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (command, rest) = match line.split_once(' ') {
                Some((command, rest)) => (command, rest),
                None => (line, ""),
            };
            match command {
                "print" => {
                    if !self.stdout(format!("{}\n", rest)).await {
                        return false;
                    }
                }
                "set" => {
                    if let Some((name, value)) = rest.split_once(' ') {
                        let type_repr = if value.parse::<i64>().is_ok() {
                            "int"
                        } else if value.parse::<f64>().is_ok() {
                            "float"
                        } else {
                            "str"
                        };
                        self.vars
                            .insert(name.to_string(), (value.to_string(), type_repr.to_string()));
                    }
                }
                "getvar" => match self.vars.get(rest) {
                    Some((value, _)) => {
                        if !self.stdout(format!("{}\n", value)).await {
                            return false;
                        }
                    }
                    None => {
                        self.error("NameError", &format!("name '{}' is not defined", rest))
                            .await;
                        failed = true;
                        break 'lines;
                    }
                },
                "expr" => {
                    if !self
                        .emit(WireMessage::Result {
                            text: rest.to_string(),
                        })
                        .await
                    {
                        return false;
                    }
                }
                "log" => {
                    let mut parts = rest.splitn(3, ' ');
                    let level = parts.next().unwrap_or("info");
                    let tag = parts.next().unwrap_or("");
                    let message = parts.next().unwrap_or("");
                    let body = serde_json::json!({
                        "level": level,
                        "tag": tag,
                        "message": message,
                    });
                    if !self.stdout(format!("{}{}", LOG_SENTINEL, body)).await {
                        return false;
                    }
                }
                "write" => {
                    if let Some((file, content)) = rest.split_once(' ') {
                        let _ = std::fs::write(self.cwd.join(file), content);
                    }
                }
                "display" => {
                    if let Some((mime, data)) = rest.split_once(' ') {
                        if !self
                            .emit(WireMessage::Display {
                                mime: mime.to_string(),
                                data_base64: data.to_string(),
                            })
                            .await
                        {
                            return false;
                        }
                    }
                }
                "sleep" => {
                    let millis: u64 = rest.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                "raise" => {
                    self.error("RuntimeError", rest).await;
                    failed = true;
                    break 'lines;
                }
                "exit" => return false,
                other => {
                    self.error("NameError", &format!("unknown statement: {}", other))
                        .await;
                    failed = true;
                    break 'lines;
                }
            }
        }
        self.emit(WireMessage::ExecuteReply {
            status: if failed {
                ReplyStatus::Error
            } else {
                ReplyStatus::Ok
            },
        })
        .await
    }
}

fn json_binding(value: &serde_json::Value) -> (String, String) {
    match value {
        serde_json::Value::Null => ("None".to_string(), "NoneType".to_string()),
        serde_json::Value::Bool(b) => (b.to_string(), "bool".to_string()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => {
            (n.to_string(), "int".to_string())
        }
        serde_json::Value::Number(n) => (n.to_string(), "float".to_string()),
        serde_json::Value::String(s) => (s.clone(), "str".to_string()),
        serde_json::Value::Array(_) => (value.to_string(), "list".to_string()),
        serde_json::Value::Object(_) => (value.to_string(), "dict".to_string()),
    }
}

async fn run_mock_kernel(
    mut input: mpsc::Receiver<String>,
    out: mpsc::Sender<WireMessage>,
    cwd: PathBuf,
) {
    let mut kernel = MockKernel {
        out,
        cwd,
        vars: BTreeMap::new(),
        baseline: HashSet::new(),
        registry: HashMap::new(),
        watermark: SystemTime::now(),
    };

    // Readiness handshake.
    if !kernel.idle().await {
        return;
    }

    while let Some(line) = input.recv().await {
        let frame: InputFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let alive = match frame {
            InputFrame::Exec { code } => kernel.run_code(&code).await,
            InputFrame::Ctrl { directive } => kernel.handle_directive(directive).await,
        };
        if !alive {
            return;
        }
    }
}
