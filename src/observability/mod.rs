// src/observability/mod.rs
//! Logging and metrics
//!
//! The library only emits through the `tracing` and `metrics` facades.
//! Binaries call [`init_tracing`] once at startup; installing a metrics
//! recorder/exporter is left to the embedding application.
//!
//! # Environment Variables
//!
//! - `RELAY_POOL_LOG` - Log filter (overrides RUST_LOG)
//! - `RELAY_POOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use crate::utils::errors::{PoolError, Result};
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Metric names emitted by the pool
pub mod names {
    /// Counter: events pushed on the event bus, labelled by `kind`
    pub const EVENTS_TOTAL: &str = "relay_pool_events_total";
    /// Counter: workers successfully allocated
    pub const WORKERS_ALLOCATED_TOTAL: &str = "relay_pool_workers_allocated_total";
    /// Gauge: workers currently tracked by the watcher
    pub const WORKERS_LIVE: &str = "relay_pool_workers_live";
    /// Counter: executions, labelled by `outcome`
    pub const EXEC_TOTAL: &str = "relay_pool_exec_total";
    /// Histogram: execution duration in seconds
    pub const EXEC_DURATION_SECONDS: &str = "relay_pool_exec_duration_seconds";
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Initialize the global tracing subscriber from the environment
pub fn init_tracing() -> Result<()> {
    let format = std::env::var("RELAY_POOL_LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse().ok())
        .unwrap_or_default();

    init_tracing_with(format)
}

/// Initialize the global tracing subscriber with an explicit format
pub fn init_tracing_with(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_env("RELAY_POOL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // workers talk over stdout, logs must stay on stderr
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| PoolError::Config(format!("Failed to initialize tracing: {}", e)))
}
