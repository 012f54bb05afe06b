// src/bin/relay-worker.rs
//! Reference worker speaking the relay protocol
//!
//! Used by the integration tests and as a template for real workers. It
//! serves over stdio, or over the socket exported by the pool in
//! `RELAY_POOL_SOCKET`.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use relay_pool::observability::init_tracing;
use relay_pool::{Payload, Responder};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "relay-worker", version, about = "Reference worker for relay-pool")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, Clone)]
enum Mode {
    /// Answer with the request unchanged
    Echo,

    /// Answer with this process's pid
    Pid,

    /// Report every request as an application error
    Error,

    /// Sleep before echoing
    Sleep {
        #[arg(long)]
        millis: u64,
    },

    /// Exit without answering
    Crash,

    /// Hold the given amount of resident memory, then echo
    Memory {
        #[arg(long)]
        mib: usize,
    },

    /// Ask to be restarted on every request
    RestartAlways,

    /// Ask to be restarted once per marker file, then echo
    RestartOnce {
        #[arg(long)]
        marker: PathBuf,
    },

    /// Delay the handshake
    SlowStart {
        #[arg(long)]
        millis: u64,

        /// Write the pid here before sleeping
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Write each request body to stderr, then echo
    Log,
}

#[tokio::main]
async fn main() -> Result<()> {
    // the pool may already have installed a subscriber in-process; not here
    let _ = init_tracing();
    let cli = Cli::parse();

    if let Mode::SlowStart { millis, pid_file } = &cli.mode {
        if let Some(path) = pid_file {
            std::fs::write(path, std::process::id().to_string())
                .with_context(|| format!("Failed to write pid file {}", path.display()))?;
        }
        tokio::time::sleep(Duration::from_millis(*millis)).await;
    }

    let mut responder = Responder::from_env()
        .await
        .context("Failed to connect to the pool")?;

    // resident until exit
    let mut ballast: Vec<u8> = Vec::new();
    if let Mode::Memory { mib } = &cli.mode {
        ballast = vec![1u8; mib * 1024 * 1024];
    }

    while let Some(request) = responder.next_request().await? {
        debug!(bytes = request.body.len(), "Request");

        match &cli.mode {
            Mode::Echo | Mode::SlowStart { .. } | Mode::Memory { .. } => {
                responder.respond(request).await?
            }
            Mode::Pid => {
                let pid = std::process::id().to_string();
                responder.respond(Payload::new(pid)).await?
            }
            Mode::Error => {
                let message = format!("application error: {}", request.body_str());
                responder.respond_error(message).await?
            }
            Mode::Sleep { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                responder.respond(request).await?
            }
            Mode::Crash => std::process::exit(1),
            Mode::RestartAlways => responder.request_restart().await?,
            Mode::RestartOnce { marker } => {
                if marker.exists() {
                    responder.respond(request).await?
                } else {
                    std::fs::write(marker, b"restarted")
                        .with_context(|| format!("Failed to write marker {}", marker.display()))?;
                    responder.request_restart().await?
                }
            }
            Mode::Log => {
                eprintln!("{}", request.body_str());
                responder
                    .respond(Payload::with_context(Bytes::from_static(b"logged"), request.body))
                    .await?
            }
        }
    }

    debug!(ballast = ballast.len(), "Stopping");
    Ok(())
}
