// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Code execution service REST API server binary

use ces_rest_server::{Server, ServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address for the server
    #[arg(short, long, default_value = "127.0.0.1:8700")]
    bind: SocketAddr,

    /// Root directory for per-session working directories
    #[arg(short, long, default_value = "workspace")]
    workspace_root: PathBuf,

    /// Shared secret expected in the X-API-Key header
    #[arg(long, env = "CES_API_KEY")]
    api_key: Option<String>,

    /// Let loopback peers bypass the API key check
    #[arg(long)]
    allow_loopback: bool,

    /// Interpreter command used for session kernels
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Enable CORS for development
    #[arg(long)]
    cors: bool,

    /// Per-execution timeout in seconds
    #[arg(long, default_value_t = 300)]
    exec_timeout_secs: u64,

    /// Idle session expiry in seconds; 0 disables the sweep
    #[arg(long, default_value_t = 0)]
    idle_timeout_secs: u64,

    /// Log filter, e.g. "info" or "ces_core=debug"
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("Starting code execution service");

    let config = ServerConfig {
        bind_addr: args.bind,
        workspace_root: args.workspace_root,
        api_key: args.api_key,
        allow_loopback: args.allow_loopback,
        enable_cors: args.cors,
        interpreter_command: args.interpreter,
        exec_timeout: Duration::from_secs(args.exec_timeout_secs),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        ..Default::default()
    };

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
