// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Control protocol between the service and the in-interpreter adapter.
//!
//! Both directions are line-oriented JSON: the service writes one
//! [`InputFrame`] per line to the interpreter's stdin, and the adapter
//! answers with one [`WireMessage`] per line on stdout. Every directive is
//! acknowledged with a `status: idle` frame once its payload events (if any)
//! have been emitted; user code is acknowledged with `execute_reply` and no
//! trailing idle, which keeps the post-exec idle unambiguous for the engine.

use ces_api_contract::{LogEntry, SurfacedVariable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sentinel prefix under which extensions emit structured log records on
/// stdout. Everything after the prefix is a JSON-encoded [`LogEntry`].
pub const LOG_SENTINEL: &str = "\u{1}CESLOG\u{1}";

/// Administrative directives understood by the control adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Directive {
    /// Establish session identity and change the working directory.
    SessionInit { session_id: String, cwd: String },
    /// Store extension source in the adapter registry; no user-visible effect.
    ExtRegister { name: String, source: String },
    /// Instantiate a registered extension and bind it in the user namespace.
    ExtLoad {
        name: String,
        config: HashMap<String, String>,
    },
    /// Marker framing the start of a user code execution.
    PreExec { exec_id: String, index: u64 },
    /// Trigger the variable snapshot and artifact scan.
    PostExec { exec_id: String, index: u64 },
    /// Overwrite user-namespace bindings from outside.
    VarUpdate {
        bindings: HashMap<String, serde_json::Value>,
    },
    /// Orderly interpreter shutdown.
    Shutdown,
}

/// One line written to the interpreter's input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum InputFrame {
    /// A user code fragment.
    Exec { code: String },
    /// A control directive.
    Ctrl { directive: Directive },
}

impl InputFrame {
    pub fn code(code: impl Into<String>) -> Self {
        InputFrame::Exec { code: code.into() }
    }

    pub fn ctrl(directive: Directive) -> Self {
        InputFrame::Ctrl { directive }
    }

    /// Encode as a single protocol line (no trailing newline).
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("input frame serialization cannot fail")
    }
}

/// Output stream name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Interpreter scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    Idle,
    Busy,
}

/// Outcome reported by an execute reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// One structured message read from the interpreter's output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum WireMessage {
    /// A chunk of textual output on stdout or stderr.
    Stream { name: StreamName, text: String },
    /// Scheduling state change; `idle` acknowledges a directive.
    Status { state: KernelState },
    /// The interpreter finished (or raised) for the submitted code.
    ExecuteReply { status: ReplyStatus },
    /// A raised exception.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// A rich display payload, e.g. an inline image.
    Display { mime: String, data_base64: String },
    /// Text representation of the final expression value.
    Result { text: String },
    /// Variable snapshot emitted in response to `post-exec`.
    Variables { items: Vec<SurfacedVariable> },
    /// A file newly written under the session cwd.
    Artifact { file_name: String, mime_type: String },
}

/// Decode one raw output line into a [`WireMessage`].
///
/// Interpreter noise that is not valid protocol JSON is folded into a stdout
/// stream chunk instead of killing the session; real kernels occasionally
/// print warnings straight to the channel.
pub fn decode_wire_line(line: &str) -> WireMessage {
    match serde_json::from_str::<WireMessage>(line) {
        Ok(message) => message,
        Err(_) => WireMessage::Stream {
            name: StreamName::Stdout,
            text: format!("{}\n", line),
        },
    }
}

/// Recognise an extension log record in a stdout chunk.
///
/// The adapter frames log records as `LOG_SENTINEL` followed by a JSON
/// [`LogEntry`]; a chunk that does not start with the sentinel is ordinary
/// user output.
pub fn parse_log_chunk(text: &str) -> Option<LogEntry> {
    let body = text.strip_prefix(LOG_SENTINEL)?;
    serde_json::from_str(body.trim_end()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ces_api_contract::LogLevel;

    #[test]
    fn directives_use_kebab_case_tags() {
        let frame = InputFrame::ctrl(Directive::PreExec {
            exec_id: "e1".into(),
            index: 3,
        });
        let line = frame.encode();
        assert!(line.contains("\"op\":\"ctrl\""), "{}", line);
        assert!(line.contains("\"kind\":\"pre-exec\""), "{}", line);

        let parsed: InputFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn decodes_protocol_lines() {
        let msg = decode_wire_line(r#"{"channel":"stream","name":"stderr","text":"boom\n"}"#);
        assert_eq!(
            msg,
            WireMessage::Stream {
                name: StreamName::Stderr,
                text: "boom\n".into()
            }
        );

        let msg = decode_wire_line(r#"{"channel":"status","state":"idle"}"#);
        assert_eq!(
            msg,
            WireMessage::Status {
                state: KernelState::Idle
            }
        );

        let msg = decode_wire_line(r#"{"channel":"execute_reply","status":"error"}"#);
        assert_eq!(
            msg,
            WireMessage::ExecuteReply {
                status: ReplyStatus::Error
            }
        );
    }

    #[test]
    fn non_protocol_noise_becomes_stdout() {
        let msg = decode_wire_line("warning: something leaked to the channel");
        match msg {
            WireMessage::Stream {
                name: StreamName::Stdout,
                text,
            } => assert_eq!(text, "warning: something leaked to the channel\n"),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn log_sentinel_round_trip() {
        let chunk = format!(
            "{}{}",
            LOG_SENTINEL,
            r#"{"level":"warn","tag":"sql","message":"slow query"}"#
        );
        let entry = parse_log_chunk(&chunk).unwrap();
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.tag, "sql");
        assert_eq!(entry.message, "slow query");

        assert!(parse_log_chunk("plain output\n").is_none());
    }
}
