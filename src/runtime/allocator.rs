// src/runtime/allocator.rs
//! Worker allocation
//!
//! Turns the command factory and the relay factory into ready workers,
//! bounded by the allocate timeout.

use crate::events::{EventBus, EventKind};
use crate::observability::names;
use crate::relay::RelayFactory;
use crate::runtime::process_manager::CommandFactory;
use crate::runtime::worker::Worker;
use crate::utils::errors::{PoolError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Spawns ready workers
pub struct Allocator {
    command: Arc<dyn CommandFactory>,
    factory: Arc<dyn RelayFactory>,
    timeout: Duration,
    events: Arc<EventBus>,
}

impl Allocator {
    pub fn new(
        command: Arc<dyn CommandFactory>,
        factory: Arc<dyn RelayFactory>,
        timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            command,
            factory,
            timeout,
            events,
        }
    }

    /// Spawn one worker and wait for its handshake
    ///
    /// If the timeout elapses first the half-started process is killed.
    pub async fn allocate(&self) -> Result<Worker> {
        let command = self.command.command();
        let spawn = self
            .factory
            .spawn_worker(command, Arc::clone(&self.events));

        let worker = match tokio::time::timeout(self.timeout, spawn).await {
            Ok(Ok(worker)) => worker,
            Ok(Err(PoolError::WorkerAllocate(msg))) => return Err(PoolError::WorkerAllocate(msg)),
            Ok(Err(e)) => return Err(PoolError::WorkerAllocate(e.to_string())),
            Err(_) => {
                return Err(PoolError::WorkerAllocate(format!(
                    "worker did not start within {:?}",
                    self.timeout
                )))
            }
        };

        debug!(pid = worker.pid(), "Worker allocated");
        metrics::counter!(names::WORKERS_ALLOCATED_TOTAL).increment(1);
        worker.emit(EventKind::WorkerConstruct, "worker started");

        Ok(worker)
    }

    /// Allocate `count` workers sequentially
    ///
    /// On failure the workers already started are killed.
    pub async fn allocate_many(&self, count: usize) -> Result<Vec<Worker>> {
        let mut workers = Vec::with_capacity(count);

        for _ in 0..count {
            match self.allocate().await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &workers {
                        if let Err(kill_err) = worker.kill() {
                            warn!(pid = worker.pid(), "Failed to kill worker: {}", kill_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(workers)
    }
}
