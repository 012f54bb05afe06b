// src/utils/errors.rs
//! Error taxonomy for the worker pool
//!
//! Every public operation returns [`Result`]. The pool classifies worker
//! failures by variant:
//!
//! - **WorkerAllocate**: spawning or handshaking a worker failed
//! - **NoFreeWorkers**: no worker became available within the allocate timeout
//! - **ExecTtl**: a request exceeded its deadline, the worker is discarded
//! - **SoftJob**: the application reported an error, the worker stays in service
//! - **Network**: the relay broke, the worker is killed
//!
//! Anything else is treated as unclassified: the worker is stopped and replaced.

use crate::runtime::worker::WorkerState;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors produced by the pool, its workers and the relay
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker allocation failed: {0}")]
    WorkerAllocate(String),

    #[error("No free workers in the pool (waited {0:?})")]
    NoFreeWorkers(Duration),

    #[error("Worker watcher stopped")]
    WatcherStopped,

    #[error("Execution TTL of {0:?} exceeded")]
    ExecTtl(Duration),

    #[error("Worker error: {0}")]
    SoftJob(String),

    #[error("Relay error: {0}")]
    Network(String),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Worker is not ready ({0})")]
    WorkerNotReady(WorkerState),

    #[error("Payload can not be empty")]
    EmptyPayload,

    #[error("Worker requested restart {0} times in a row")]
    RestartLoop(usize),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    /// The request exceeded its execution deadline
    pub fn is_exec_ttl(&self) -> bool {
        matches!(self, PoolError::ExecTtl(_))
    }

    /// Application-level error reported by the worker itself
    pub fn is_soft_job(&self) -> bool {
        matches!(self, PoolError::SoftJob(_))
    }

    /// The relay to the worker broke
    pub fn is_network(&self) -> bool {
        matches!(self, PoolError::Network(_))
    }

    pub fn is_no_free_workers(&self) -> bool {
        matches!(self, PoolError::NoFreeWorkers(_))
    }

    pub fn is_allocate(&self) -> bool {
        matches!(self, PoolError::WorkerAllocate(_))
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(e: config::ConfigError) -> Self {
        PoolError::Config(e.to_string())
    }
}

impl From<nix::errno::Errno> for PoolError {
    fn from(e: nix::errno::Errno) -> Self {
        PoolError::Process(e.to_string())
    }
}
