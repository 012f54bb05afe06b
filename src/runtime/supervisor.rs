// src/runtime/supervisor.rs
//! Supervised pool
//!
//! Wraps a [`StaticPool`] and, every `watch_tick`, inspects each worker
//! against the configured limits, in order:
//!
//! 1. **TTL**: worker older than `ttl`
//! 2. **Memory**: resident memory at or above `max_worker_memory`
//! 3. **Idle TTL**: Ready worker unused for `idle_ttl`
//! 4. **Exec TTL**: Working worker busy for longer than `exec_ttl`
//!
//! The first limit hit wins. Idle workers are removed immediately; busy
//! workers are only flagged and disposed of when their request completes.

use crate::events::{EventKind, EventListener};
use crate::payload::Payload;
use crate::runtime::pool::{Pool, StaticPool};
use crate::runtime::process_state::{process_state, ProcessState};
use crate::runtime::worker::{Worker, WorkerInfo, WorkerState};
use crate::utils::config::{PoolConfig, SupervisorConfig};
use crate::utils::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// [`StaticPool`] plus a periodic limit check
pub struct SupervisedPool {
    pool: Arc<StaticPool>,
    cfg: SupervisorConfig,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisedPool {
    pub fn new(pool: Arc<StaticPool>, cfg: SupervisorConfig) -> Self {
        Self {
            pool,
            cfg,
            ticker: Mutex::new(None),
        }
    }

    /// Start the control loop; does nothing if it already runs
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }

        let pool = Arc::clone(&self.pool);
        let cfg = self.cfg.clone();
        *ticker = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + cfg.watch_tick;
            let mut interval = tokio::time::interval_at(start, cfg.watch_tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                control(&pool, &cfg);
            }
        }));

        info!(watch_tick = ?self.cfg.watch_tick, "Supervisor started");
    }

    /// Stop the control loop
    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
            debug!("Supervisor stopped");
        }
    }

    pub fn inner(&self) -> &StaticPool {
        &self.pool
    }
}

/// Smaller of the caller's deadline and the configured exec TTL
fn effective_ttl(cfg: &SupervisorConfig, ttl: Duration) -> Duration {
    if cfg.exec_ttl.is_zero() {
        ttl
    } else {
        ttl.min(cfg.exec_ttl)
    }
}

impl Drop for SupervisedPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One supervision pass over the live workers
fn control(pool: &StaticPool, cfg: &SupervisorConfig) {
    let max_memory = cfg.max_worker_memory_bytes();

    for worker in pool.watcher().handles() {
        let state = worker.state().get();
        if !state.is_active() {
            continue;
        }

        if !cfg.ttl.is_zero() && worker.state().age() >= cfg.ttl {
            evict(pool, &worker, EventKind::Ttl, format!("ttl of {:?} reached", cfg.ttl));
            continue;
        }

        if let Some(limit) = max_memory {
            let reading = memory_reading(process_state(worker.pid()), worker.has_exited());
            let usage = match reading {
                Ok(usage) => usage,
                Err(e) => {
                    worker.emit(
                        EventKind::SupervisorError,
                        format!("can't read worker memory usage: {}", e),
                    );
                    None
                }
            };
            if let Some(usage) = usage {
                if usage.memory_usage >= limit {
                    evict(
                        pool,
                        &worker,
                        EventKind::MaxMemory,
                        format!(
                            "memory usage {} MiB exceeds limit of {} MiB",
                            usage.memory_mib(),
                            cfg.max_worker_memory
                        ),
                    );
                    continue;
                }
            }
        }

        if !cfg.idle_ttl.is_zero()
            && state == WorkerState::Ready
            && worker.state().idle_for() >= cfg.idle_ttl
        {
            evict(
                pool,
                &worker,
                EventKind::IdleTtl,
                format!("idle for longer than {:?}", cfg.idle_ttl),
            );
            continue;
        }

        if !cfg.exec_ttl.is_zero() && state == WorkerState::Working {
            if let Some(elapsed) = worker.state().exec_elapsed() {
                if elapsed >= cfg.exec_ttl
                    && worker
                        .state()
                        .compare_and_set(WorkerState::Working, WorkerState::Invalid)
                {
                    worker.emit(
                        EventKind::ExecTtl,
                        format!("execution running for {:?}, limit {:?}", elapsed, cfg.exec_ttl),
                    );
                }
            }
        }
    }
}

/// A failed reading only matters while the process is still running
fn memory_reading(reading: Result<ProcessState>, exited: bool) -> Result<Option<ProcessState>> {
    match reading {
        Ok(usage) => Ok(Some(usage)),
        // the watcher handles exited processes
        Err(_) if exited => Ok(None),
        Err(e) => Err(e),
    }
}

fn evict(pool: &StaticPool, worker: &Worker, kind: EventKind, message: String) {
    worker.emit(kind, message);
    pool.watcher().remove(worker);
}

#[async_trait]
impl Pool for SupervisedPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload> {
        if self.cfg.exec_ttl.is_zero() {
            self.pool.exec(payload).await
        } else {
            self.pool.exec_with_ttl(self.cfg.exec_ttl, payload).await
        }
    }

    async fn exec_with_ttl(&self, ttl: Duration, payload: &Payload) -> Result<Payload> {
        self.pool
            .exec_with_ttl(effective_ttl(&self.cfg, ttl), payload)
            .await
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers()
    }

    fn remove_worker(&self, pid: u32) -> bool {
        self.pool.remove_worker(pid)
    }

    async fn reset(&self, timeout: Duration) -> Result<()> {
        self.pool.reset(timeout).await
    }

    async fn destroy(&self, timeout: Duration) {
        self.stop();
        self.pool.destroy(timeout).await;
    }

    fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.pool.add_listener(listener);
    }

    fn config(&self) -> &PoolConfig {
        self.pool.config()
    }
}
