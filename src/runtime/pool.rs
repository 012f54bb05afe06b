// src/runtime/pool.rs
//! Static worker pool
//!
//! A fixed number of long-lived workers serve requests one at a time.
//! Failures are classified per request:
//!
//! - **ExecTtl**: the worker is killed and replaced
//! - **SoftJob**: the worker stays in service unless its budget is spent
//! - **Network**: the worker is killed and replaced
//! - anything else: the worker is stopped and replaced
//!
//! In debug mode no workers are kept: every request gets a fresh process.

use crate::events::{Event, EventBus, EventKind, EventListener};
use crate::observability::names;
use crate::payload::Payload;
use crate::relay::RelayFactory;
use crate::runtime::allocator::Allocator;
use crate::runtime::process_manager::CommandFactory;
use crate::runtime::supervisor::SupervisedPool;
use crate::runtime::watcher::{WorkerWatcher, DRAIN_POLL_INTERVAL};
use crate::runtime::worker::{Worker, WorkerInfo, WorkerState};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Operations shared by the static and the supervised pool
#[async_trait]
pub trait Pool: Send + Sync {
    /// Execute a request on a free worker
    async fn exec(&self, payload: &Payload) -> Result<Payload>;

    /// Execute a request, killing the worker if it takes longer than `ttl`
    async fn exec_with_ttl(&self, ttl: Duration, payload: &Payload) -> Result<Payload>;

    /// Snapshot of the live workers
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Take the worker with `pid` out of service; false if unknown
    ///
    /// A busy worker finishes its request first.
    fn remove_worker(&self, pid: u32) -> bool;

    /// Replace every worker, giving busy ones up to `timeout` to finish
    async fn reset(&self, timeout: Duration) -> Result<()>;

    /// Stop every worker, giving busy ones up to `timeout` to finish
    async fn destroy(&self, timeout: Duration);

    /// Receive lifecycle events from now on
    fn add_listener(&self, listener: Arc<dyn EventListener>);

    fn config(&self) -> &PoolConfig;
}

/// Build a pool from `cfg`, supervised if a supervisor section is present
///
/// Fails if the initial workers cannot be started within the allocate
/// timeout; no process is left running in that case.
pub async fn new_pool(
    command: impl CommandFactory + 'static,
    factory: Arc<dyn RelayFactory>,
    cfg: PoolConfig,
) -> Result<Arc<dyn Pool>> {
    new_pool_with_events(command, factory, cfg, Arc::new(EventBus::new())).await
}

/// [`new_pool`] with a pre-populated event bus
///
/// Listeners already registered on `events` observe the construction of
/// the initial workers.
pub async fn new_pool_with_events(
    command: impl CommandFactory + 'static,
    factory: Arc<dyn RelayFactory>,
    mut cfg: PoolConfig,
    events: Arc<EventBus>,
) -> Result<Arc<dyn Pool>> {
    cfg.init_defaults();
    cfg.validate()?;

    let supervisor = cfg.supervisor.clone();
    let pool = StaticPool::new(Arc::new(command), factory, cfg, events).await?;

    match supervisor {
        Some(supervisor) => {
            let supervised = SupervisedPool::new(Arc::new(pool), supervisor);
            supervised.start();
            Ok(Arc::new(supervised))
        }
        None => Ok(Arc::new(pool)),
    }
}

/// Pool of long-lived workers
pub struct StaticPool {
    cfg: PoolConfig,
    events: Arc<EventBus>,
    allocator: Arc<Allocator>,
    watcher: WorkerWatcher,
    /// Single-use workers serving a request in debug mode
    in_flight: Mutex<Vec<Worker>>,
}

impl StaticPool {
    /// Start `cfg.num_workers` workers
    ///
    /// `cfg` is used as given; [`new_pool`] applies defaults first.
    pub async fn new(
        command: Arc<dyn CommandFactory>,
        factory: Arc<dyn RelayFactory>,
        cfg: PoolConfig,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let allocator = Arc::new(Allocator::new(
            command,
            factory,
            cfg.allocate_timeout,
            Arc::clone(&events),
        ));
        let watcher = WorkerWatcher::new(Arc::clone(&allocator), cfg.num_workers, Arc::clone(&events));

        if !cfg.debug {
            let workers = allocator.allocate_many(cfg.num_workers).await?;
            watcher.watch(workers);
        }

        info!(
            num_workers = cfg.num_workers,
            max_jobs = cfg.max_jobs,
            debug = cfg.debug,
            "Worker pool started"
        );

        Ok(Self {
            cfg,
            events,
            allocator,
            watcher,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    pub fn watcher(&self) -> &WorkerWatcher {
        &self.watcher
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    async fn exec_inner(&self, ttl: Option<Duration>, payload: &Payload) -> Result<Payload> {
        if payload.is_empty() {
            return Err(PoolError::EmptyPayload);
        }

        let mut deadline = tokio::time::Instant::now() + self.cfg.allocate_timeout;
        let mut restarts = 0;
        loop {
            let worker = self.acquire(deadline).await?;

            let started = Instant::now();
            let result = match ttl {
                Some(ttl) => worker.exec_with_ttl(ttl, payload).await,
                None => worker.exec(payload).await,
            };

            if let Err(PoolError::WorkerNotReady(state)) = &result {
                // condemned while held, before anything was sent
                debug!(pid = worker.pid(), %state, "Worker taken out of service, retrying");
                self.dispose(worker).await;
                continue;
            }
            record_exec(&result, started.elapsed());

            let response = match result {
                Ok(response) => response,
                Err(e) => return Err(self.handle_error(e, worker).await),
            };

            if response.is_stop_request() {
                debug!(pid = worker.pid(), "Worker requested restart");
                self.stop_worker(&worker).await;
                self.dispose(worker).await;

                restarts += 1;
                if restarts > self.cfg.max_restart_retries {
                    let err = PoolError::RestartLoop(restarts);
                    self.events
                        .push(Event::new(EventKind::PoolError, err.to_string()));
                    return Err(err);
                }
                deadline = tokio::time::Instant::now() + self.cfg.allocate_timeout;
                continue;
            }

            self.check_max_jobs(&worker);
            self.dispose(worker).await;
            return Ok(response);
        }
    }

    /// A free worker, or a fresh one in debug mode
    async fn acquire(&self, deadline: tokio::time::Instant) -> Result<Worker> {
        if self.cfg.debug {
            return self.acquire_single_use().await;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match self.watcher.take(remaining).await {
            Err(PoolError::NoFreeWorkers(waited)) => {
                self.events.push(Event::new(
                    EventKind::NoFreeWorkers,
                    format!("no free workers after {:?}", waited),
                ));
                Err(PoolError::NoFreeWorkers(waited))
            }
            other => other,
        }
    }

    async fn acquire_single_use(&self) -> Result<Worker> {
        if self.watcher.is_stopped() {
            return Err(PoolError::WatcherStopped);
        }

        let worker = self.allocator.allocate().await?;
        let admitted = {
            let mut in_flight = self.in_flight.lock();
            let admitted = !self.watcher.is_stopped();
            if admitted {
                in_flight.push(worker.clone());
            }
            admitted
        };

        if !admitted {
            worker.state().set(WorkerState::Destroyed);
            if let Err(e) = worker.kill() {
                warn!(pid = worker.pid(), "Failed to kill worker: {}", e);
            }
            return Err(PoolError::WatcherStopped);
        }
        Ok(worker)
    }

    /// Wait for single-use workers to finish, then kill the rest
    async fn destroy_in_flight(&self, deadline: tokio::time::Instant) {
        while !self.in_flight.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = std::mem::take(&mut *self.in_flight.lock());
        for worker in &remaining {
            worker.state().set(WorkerState::Destroyed);
            if let Err(e) = worker.kill() {
                warn!(pid = worker.pid(), "Failed to kill worker: {}", e);
            }
        }
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "Killed single-use workers still in flight");
        }
    }

    /// Hand a worker back after a request
    async fn dispose(&self, worker: Worker) {
        if self.cfg.debug {
            self.in_flight.lock().retain(|w| w.pid() != worker.pid());
            if !worker.has_exited() {
                self.stop_worker(&worker).await;
            }
            return;
        }
        self.watcher.release(worker);
    }

    async fn stop_worker(&self, worker: &Worker) {
        if let Err(e) = worker.stop().await {
            worker.emit(EventKind::WorkerError, format!("failed to stop worker: {}", e));
        }
    }

    fn check_max_jobs(&self, worker: &Worker) {
        if self.cfg.max_jobs == 0 || worker.state().num_execs() < self.cfg.max_jobs {
            return;
        }

        if worker
            .state()
            .compare_and_set(WorkerState::Ready, WorkerState::MaxJobsReached)
        {
            worker.emit(
                EventKind::MaxJobsReached,
                format!("worker reached max_jobs ({})", self.cfg.max_jobs),
            );
        }
    }

    /// Decide the fate of a worker after a failed request
    async fn handle_error(&self, err: PoolError, worker: Worker) -> PoolError {
        match &err {
            PoolError::ExecTtl(_) => {
                worker.emit(EventKind::ExecTtl, err.to_string());
                worker.state().set(WorkerState::Invalid);
            }
            PoolError::SoftJob(_) => {
                worker.emit(EventKind::WorkerError, err.to_string());
                self.check_max_jobs(&worker);
                if worker.state().get() == WorkerState::MaxJobsReached {
                    worker.state().set(WorkerState::Invalid);
                    self.stop_worker(&worker).await;
                }
            }
            PoolError::Network(_) => {
                worker.emit(EventKind::WorkerError, err.to_string());
                worker.state().set(WorkerState::Invalid);
                if let Err(kill_err) = worker.kill() {
                    warn!(pid = worker.pid(), "Failed to kill worker: {}", kill_err);
                }
            }
            _ => {
                worker.emit(EventKind::WorkerError, err.to_string());
                worker.state().set(WorkerState::Invalid);
                self.stop_worker(&worker).await;
            }
        }

        self.dispose(worker).await;
        err
    }
}

fn record_exec(result: &Result<Payload>, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(PoolError::SoftJob(_)) => "soft_error",
        Err(PoolError::ExecTtl(_)) => "exec_ttl",
        Err(PoolError::Network(_)) => "network",
        Err(_) => "error",
    };
    metrics::counter!(names::EXEC_TOTAL, "outcome" => outcome).increment(1);
    metrics::histogram!(names::EXEC_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

#[async_trait]
impl Pool for StaticPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload> {
        self.exec_inner(None, payload).await
    }

    async fn exec_with_ttl(&self, ttl: Duration, payload: &Payload) -> Result<Payload> {
        self.exec_inner(Some(ttl), payload).await
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.watcher.list()
    }

    fn remove_worker(&self, pid: u32) -> bool {
        self.watcher.remove_pid(pid)
    }

    async fn reset(&self, timeout: Duration) -> Result<()> {
        if self.cfg.debug {
            return Ok(());
        }

        self.watcher.reset(timeout).await;
        let workers = self.allocator.allocate_many(self.cfg.num_workers).await?;
        self.watcher.watch(workers);

        self.events
            .push(Event::new(EventKind::PoolRestart, "pool reset"));
        Ok(())
    }

    async fn destroy(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        self.watcher.destroy(timeout).await;
        if self.cfg.debug {
            self.destroy_in_flight(deadline).await;
        }
    }

    fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.events.add_listener(listener);
    }

    fn config(&self) -> &PoolConfig {
        &self.cfg
    }
}
