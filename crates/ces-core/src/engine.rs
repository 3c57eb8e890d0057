// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Execution engine: drives one execution round-trip end-to-end.
//!
//! The engine owns the only mutable reference to the interpreter handle for
//! the duration of the call, demultiplexes the interleaved output stream
//! into typed events, accumulates them into an [`ExecutionResult`] and
//! publishes every event to the execution's [`StreamHub`] with strictly
//! increasing sequence numbers. The terminal hub event carries the
//! assembled result as its payload.

use crate::artifacts::display_file_name;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hub::StreamHub;
use crate::interpreter::InterpreterHandle;
use crate::protocol::{
    parse_log_chunk, Directive, InputFrame, KernelState, ReplyStatus, StreamName, WireMessage,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ces_api_contract::{Artifact, ExecutionResult, OutputEvent, OutputKind};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Timing knobs for one execution round-trip.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overall budget for the user code phase.
    pub exec_timeout: Duration,
    /// Budget for one control round-trip (pre-exec, post-exec).
    pub idle_wait: Duration,
    /// Window the interpreter gets to come back after an interrupt.
    pub interrupt_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(300),
            idle_wait: Duration::from_secs(30),
            interrupt_grace: Duration::from_secs(5),
        }
    }
}

struct Accumulator<'a> {
    hub: &'a StreamHub,
    result: ExecutionResult,
    seq: u64,
    display_count: usize,
}

impl<'a> Accumulator<'a> {
    fn new(hub: &'a StreamHub, exec_id: &str, code: &str) -> Self {
        Self {
            hub,
            result: ExecutionResult::new(exec_id, code),
            seq: 0,
            display_count: 0,
        }
    }

    fn publish(&mut self, kind: OutputKind, payload: serde_json::Value) {
        let event = OutputEvent::new(self.seq, kind, payload);
        self.seq += 1;
        if let Err(err) = self.hub.publish(event) {
            warn!(error = %err, "dropping output event");
        }
    }

    /// Fold one wire message into the result and the hub.
    fn absorb(&mut self, message: WireMessage, cwd: &Path, exec_id: &str) {
        match message {
            WireMessage::Stream {
                name: StreamName::Stdout,
                text,
            } => {
                if let Some(entry) = parse_log_chunk(&text) {
                    self.publish(OutputKind::Log, json!(entry));
                    self.result.log_entries.push(entry);
                } else {
                    self.publish(OutputKind::Stdout, json!({ "text": text }));
                    self.result.stdout_chunks.push(text);
                }
            }
            WireMessage::Stream {
                name: StreamName::Stderr,
                text,
            } => {
                self.publish(OutputKind::Stderr, json!({ "text": text }));
                self.result.stderr_chunks.push(text);
            }
            WireMessage::Display { mime, data_base64 } => {
                let file_name = display_file_name(exec_id, self.display_count, &mime);
                self.display_count += 1;
                match BASE64.decode(data_base64.as_bytes()) {
                    Ok(bytes) => {
                        if let Err(err) = std::fs::write(cwd.join(&file_name), bytes) {
                            warn!(file_name, error = %err, "failed to persist display payload");
                        } else {
                            self.result.artifacts.push(Artifact {
                                logical_name: file_name.clone(),
                                mime_type: mime.clone(),
                                file_name: file_name.clone(),
                            });
                        }
                    }
                    Err(err) => {
                        warn!(file_name, error = %err, "display payload is not valid base64")
                    }
                }
                self.publish(
                    OutputKind::Display,
                    json!({ "file_name": file_name, "mime": mime }),
                );
            }
            WireMessage::Result { text } => {
                self.publish(OutputKind::Result, json!({ "text": text }));
                self.result.output.push_str(&text);
            }
            WireMessage::Error {
                ename,
                evalue,
                traceback,
            } => {
                self.result.success = false;
                let text = if traceback.is_empty() {
                    format!("{}: {}", ename, evalue)
                } else {
                    traceback.concat()
                };
                match &mut self.result.error_message {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => self.result.error_message = Some(text),
                }
                self.publish(
                    OutputKind::Error,
                    json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
                );
            }
            WireMessage::Variables { items } => {
                self.publish(OutputKind::Variables, json!({ "items": items }));
                self.result.surfaced_variables = items;
            }
            WireMessage::Artifact {
                file_name,
                mime_type,
            } => {
                // The post-exec scan also sees display payloads the engine
                // already wrote; keep one entry per file.
                if self
                    .result
                    .artifacts
                    .iter()
                    .any(|a| a.file_name == file_name)
                {
                    return;
                }
                self.publish(
                    OutputKind::Artifact,
                    json!({ "file_name": file_name, "mime_type": mime_type }),
                );
                self.result.artifacts.push(Artifact {
                    logical_name: file_name.clone(),
                    mime_type,
                    file_name,
                });
            }
            // Scheduling chatter and stray replies carry no payload.
            WireMessage::Status { .. } | WireMessage::ExecuteReply { .. } => {}
        }
    }

    /// Publish the terminal event carrying the assembled result.
    fn finish(mut self) -> ExecutionResult {
        let payload = serde_json::to_value(&self.result)
            .unwrap_or_else(|_| json!({ "execution_id": self.result.execution_id }));
        let event = OutputEvent::terminal(self.seq, OutputKind::Result, payload);
        if let Err(err) = self.hub.publish(event) {
            warn!(error = %err, "failed to publish terminal event");
        }
        self.result
    }

    fn fail(&mut self, message: &str) {
        self.result.success = false;
        self.result.error_message = Some(message.to_string());
        self.publish(OutputKind::Error, json!({ "message": message }));
    }
}

const PEER_GONE_MESSAGE: &str = "interpreter exited unexpectedly (peer gone)";

/// Run one execution against an interpreter that the caller has serialized
/// exclusive access to.
///
/// Interpreter death and timeouts are not errors at this level: they produce
/// an unsuccessful [`ExecutionResult`] and a cleanly closed hub. The only
/// `Err` is an ordering violation, which the per-session serializer is
/// supposed to make impossible.
pub async fn run_execution(
    cfg: &EngineConfig,
    handle: &mut InterpreterHandle,
    hub: &StreamHub,
    cwd: &Path,
    exec_id: &str,
    index: u64,
    code: &str,
) -> RuntimeResult<ExecutionResult> {
    let mut acc = Accumulator::new(hub, exec_id, code);

    // Frame the execution start. Under the per-session serializer the
    // interpreter must be idle here, so a timeout means the ordering
    // invariant broke.
    let pre_exec = InputFrame::ctrl(Directive::PreExec {
        exec_id: exec_id.to_string(),
        index,
    });
    if handle.submit(pre_exec).await.is_err() {
        acc.fail(PEER_GONE_MESSAGE);
        return Ok(acc.finish());
    }
    match handle.await_idle(cfg.idle_wait).await {
        Ok(()) => {}
        Err(RuntimeError::Timeout) => {
            acc.fail("interpreter busy at pre-exec");
            acc.finish();
            return Err(RuntimeError::Internal(
                "interpreter busy at pre-exec; per-session ordering violated".to_string(),
            ));
        }
        Err(_) => {
            acc.fail(PEER_GONE_MESSAGE);
            return Ok(acc.finish());
        }
    }

    if handle.submit(InputFrame::code(code)).await.is_err() {
        acc.fail(PEER_GONE_MESSAGE);
        return Ok(acc.finish());
    }

    // Consume interleaved output until the interpreter reports completion.
    let deadline = Instant::now() + cfg.exec_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next = if remaining.is_zero() {
            Err(RuntimeError::Timeout)
        } else {
            handle.next_event(remaining).await
        };
        match next {
            Ok(WireMessage::ExecuteReply { status }) => {
                if status == ReplyStatus::Error {
                    acc.result.success = false;
                    if acc.result.error_message.is_none() {
                        acc.result.error_message = Some("execution failed".to_string());
                    }
                }
                break;
            }
            Ok(message) => acc.absorb(message, cwd, exec_id),
            Err(RuntimeError::Timeout) => {
                handle.interrupt();
                let drained =
                    drain_after_interrupt(handle, cfg.interrupt_grace, &mut acc, cwd, exec_id)
                        .await;
                acc.fail("timeout");
                if !drained {
                    handle.kill(Duration::ZERO).await;
                }
                return Ok(acc.finish());
            }
            Err(_) => {
                acc.fail(PEER_GONE_MESSAGE);
                return Ok(acc.finish());
            }
        }
    }

    // Variable snapshot and artifact scan.
    let post_exec = InputFrame::ctrl(Directive::PostExec {
        exec_id: exec_id.to_string(),
        index,
    });
    if handle.submit(post_exec).await.is_err() {
        acc.fail(PEER_GONE_MESSAGE);
        return Ok(acc.finish());
    }
    let post_deadline = Instant::now() + cfg.idle_wait;
    loop {
        let remaining = post_deadline.saturating_duration_since(Instant::now());
        let next = if remaining.is_zero() {
            Err(RuntimeError::Timeout)
        } else {
            handle.next_event(remaining).await
        };
        match next {
            Ok(WireMessage::Status {
                state: KernelState::Idle,
            }) => break,
            Ok(message) => acc.absorb(message, cwd, exec_id),
            Err(RuntimeError::Timeout) => {
                warn!(exec_id, "post-exec scan did not complete in time");
                break;
            }
            Err(_) => {
                acc.fail(PEER_GONE_MESSAGE);
                return Ok(acc.finish());
            }
        }
    }

    Ok(acc.finish())
}

/// Keep the output channel drained after an interrupt so the interpreter
/// never blocks on a full pipe. Returns false when the interpreter did not
/// acknowledge within the grace window.
async fn drain_after_interrupt(
    handle: &mut InterpreterHandle,
    grace: Duration,
    acc: &mut Accumulator<'_>,
    cwd: &Path,
    exec_id: &str,
) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match handle.next_event(remaining).await {
            Ok(WireMessage::ExecuteReply { .. }) => return true,
            Ok(message) => acc.absorb(message, cwd, exec_id),
            Err(_) => return false,
        }
    }
}
