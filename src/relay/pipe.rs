// src/relay/pipe.rs
//! Relay over the worker's stdin/stdout

use crate::events::EventBus;
use crate::relay::{FramedRelay, RelayFactory};
use crate::runtime::process_manager::CommandSpec;
use crate::runtime::worker::Worker;
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tracing::debug;

/// Spawns workers that speak the frame protocol on stdin/stdout
///
/// Stderr is captured and forwarded as `WorkerLog` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeFactory;

impl PipeFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayFactory for PipeFactory {
    async fn spawn_worker(&self, command: CommandSpec, events: Arc<EventBus>) -> Result<Worker> {
        debug!("Spawning pipe worker: {}", command);

        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PoolError::WorkerAllocate(format!("failed to spawn '{}': {}", command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::WorkerAllocate("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::WorkerAllocate("worker stdout unavailable".to_string()))?;

        Worker::start(child, Box::new(FramedRelay::new(stdout, stdin)), events).await
    }
}
