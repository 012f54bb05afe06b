// src/runtime/watcher.rs
//! Worker watcher
//!
//! Owns the set of live workers and the free-list they are taken from.
//!
//! ```text
//! registry: every watched worker, idle or busy
//! free-list: Ready workers, FIFO, guarded by a semaphore
//!
//!   take ──▶ pop free-list ──▶ Ready? ──yes──▶ caller
//!                                 │ no
//!                                 └──▶ kill (Working: push back)
//!
//!   release ──▶ Ready ──▶ push free-list
//!           ──▶ MaxJobsReached ──▶ graceful stop
//!           ──▶ anything else ──▶ kill
//!
//!   process exit ──▶ unregister ──▶ allocate replacement (unless Destroyed)
//! ```

use crate::events::{Event, EventBus, EventKind};
use crate::observability::names;
use crate::runtime::allocator::Allocator;
use crate::runtime::worker::{Worker, WorkerInfo, WorkerState};
use crate::utils::errors::{PoolError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delay between attempts to replace a dead worker
pub const ALLOCATE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Poll interval while waiting for busy workers during reset/destroy
pub(crate) const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long reset/destroy wait for killed workers to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// FIFO of idle workers
///
/// Each queued worker is backed by one semaphore permit. A worker removed
/// out of band leaves a stale permit behind, which `pop` skips.
struct Container {
    queue: Mutex<VecDeque<Worker>>,
    available: Semaphore,
}

impl Container {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
        }
    }

    fn push(&self, worker: Worker) {
        self.queue.lock().push_back(worker);
        self.available.add_permits(1);
    }

    async fn pop(&self, deadline: Instant) -> std::result::Result<Worker, PopError> {
        loop {
            let permit = match tokio::time::timeout_at(deadline, self.available.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PopError::Closed),
                Err(_) => return Err(PopError::Timeout),
            };
            permit.forget();

            if let Some(worker) = self.queue.lock().pop_front() {
                return Ok(worker);
            }
        }
    }

    fn remove(&self, pid: u32) -> Option<Worker> {
        let mut queue = self.queue.lock();
        let index = queue.iter().position(|w| w.pid() == pid)?;
        queue.remove(index)
    }

    fn close(&self) {
        self.available.close();
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn drain(&self) -> Vec<Worker> {
        self.queue.lock().drain(..).collect()
    }
}

enum PopError {
    Timeout,
    Closed,
}

struct WatcherInner {
    allocator: Arc<Allocator>,
    num_workers: usize,
    events: Arc<EventBus>,
    container: RwLock<Arc<Container>>,
    registry: Mutex<Vec<Worker>>,
    /// Bumped by reset; replacements started before a reset are discarded
    generation: AtomicU64,
    stopped: AtomicBool,
}

/// Tracks live workers, hands them out and replaces the ones that die
pub struct WorkerWatcher {
    inner: Arc<WatcherInner>,
}

impl WorkerWatcher {
    pub fn new(allocator: Arc<Allocator>, num_workers: usize, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                allocator,
                num_workers,
                events,
                container: RwLock::new(Arc::new(Container::new(num_workers))),
                registry: Mutex::new(Vec::with_capacity(num_workers)),
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Register workers, make them available and watch their processes
    pub fn watch(&self, workers: Vec<Worker>) {
        for worker in workers {
            WatcherInner::register(&self.inner, worker);
        }
    }

    /// Take a Ready worker, waiting up to `timeout` for one to be released
    pub async fn take(&self, timeout: Duration) -> Result<Worker> {
        let deadline = Instant::now() + timeout;

        loop {
            let container = self.inner.container();
            let worker = match container.pop(deadline).await {
                Ok(worker) => worker,
                Err(PopError::Timeout) => return Err(PoolError::NoFreeWorkers(timeout)),
                Err(PopError::Closed) => return Err(PoolError::WatcherStopped),
            };

            match worker.state().get() {
                WorkerState::Ready => return Ok(worker),
                WorkerState::Working => {
                    // still owned by someone else
                    container.push(worker);
                    tokio::task::yield_now().await;
                }
                state => {
                    debug!(pid = worker.pid(), %state, "Discarding worker from free-list");
                    kill_logged(&worker);
                }
            }
        }
    }

    /// Return a worker after use
    pub fn release(&self, worker: Worker) {
        match worker.state().get() {
            WorkerState::Ready => self.inner.container().push(worker),
            WorkerState::MaxJobsReached => {
                tokio::spawn(async move {
                    if let Err(e) = worker.stop().await {
                        worker.emit(EventKind::WorkerError, format!("failed to stop worker: {}", e));
                    }
                });
            }
            _ => kill_logged(&worker),
        }
    }

    /// Pull a worker out of service
    ///
    /// An idle worker is killed at once. A worker held by a caller, busy or
    /// not yet executing, is only flagged `Invalid` and disposed of when it
    /// is released.
    pub fn remove(&self, worker: &Worker) {
        if let Some(idle) = self.inner.container().remove(worker.pid()) {
            idle.state().set(WorkerState::Invalid);
            kill_logged(&idle);
            return;
        }

        let state = worker.state();
        let flagged = state.compare_and_set(WorkerState::Working, WorkerState::Invalid)
            || state.compare_and_set(WorkerState::Ready, WorkerState::Invalid);
        if flagged {
            debug!(pid = worker.pid(), "Worker flagged for removal on release");
        }
    }

    /// Remove the worker with `pid`; false if it is not watched
    pub fn remove_pid(&self, pid: u32) -> bool {
        let worker = self
            .inner
            .registry
            .lock()
            .iter()
            .find(|w| w.pid() == pid)
            .cloned();

        match worker {
            Some(worker) => {
                self.remove(&worker);
                true
            }
            None => false,
        }
    }

    /// Live workers
    pub fn handles(&self) -> Vec<Worker> {
        self.inner
            .registry
            .lock()
            .iter()
            .filter(|w| !w.has_exited())
            .cloned()
            .collect()
    }

    /// Snapshot of live workers
    pub fn list(&self) -> Vec<WorkerInfo> {
        self.handles().iter().map(Worker::info).collect()
    }

    /// Number of workers currently in the free-list
    pub fn free(&self) -> usize {
        self.inner.container().len()
    }

    /// Destroy the current workers and install an empty free-list
    ///
    /// Busy workers get up to `timeout` to be released. The caller is
    /// expected to allocate and [`watch`](Self::watch) a fresh set.
    pub async fn reset(&self, timeout: Duration) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);

        let old = self.inner.container();
        old.close();
        self.inner.wait_released(&old, timeout).await;

        let workers = std::mem::take(&mut *self.inner.registry.lock());
        self.inner.destroy_workers(&workers).await;
        old.drain();

        *self.inner.container.write() = Arc::new(Container::new(self.inner.num_workers));
        metrics::gauge!(names::WORKERS_LIVE).set(0.0);
    }

    /// Permanently stop the watcher and destroy every worker
    pub async fn destroy(&self, timeout: Duration) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let container = self.inner.container();
        container.close();
        self.inner.wait_released(&container, timeout).await;

        let workers = std::mem::take(&mut *self.inner.registry.lock());
        self.inner.destroy_workers(&workers).await;
        container.drain();

        metrics::gauge!(names::WORKERS_LIVE).set(0.0);
        info!("Worker watcher destroyed");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl WatcherInner {
    fn container(&self) -> Arc<Container> {
        Arc::clone(&self.container.read())
    }

    fn register(this: &Arc<Self>, worker: Worker) {
        let live = {
            let mut registry = this.registry.lock();
            registry.push(worker.clone());
            registry.len()
        };
        Self::activate(this, worker, live);
    }

    /// Register a replacement unless a reset or destroy made it stale
    ///
    /// The check and the insertion happen under the registry lock, which
    /// reset and destroy take before clearing the registry.
    fn register_replacement(this: &Arc<Self>, worker: Worker, generation: u64) -> Option<Worker> {
        let live = {
            let mut registry = this.registry.lock();
            let stale = this.stopped.load(Ordering::Acquire)
                || this.generation.load(Ordering::Acquire) != generation
                || registry.len() >= this.num_workers;
            if stale {
                return Some(worker);
            }
            registry.push(worker.clone());
            registry.len()
        };
        Self::activate(this, worker, live);
        None
    }

    fn activate(this: &Arc<Self>, worker: Worker, live: usize) {
        metrics::gauge!(names::WORKERS_LIVE).set(live as f64);
        this.container().push(worker.clone());
        tokio::spawn(exit_watch(Arc::downgrade(this), worker));
    }

    fn unregister(&self, pid: u32) {
        let live = {
            let mut registry = self.registry.lock();
            registry.retain(|w| w.pid() != pid);
            registry.len()
        };
        metrics::gauge!(names::WORKERS_LIVE).set(live as f64);
        self.container().remove(pid);
    }

    /// Poll until every registered worker is back in `container`
    async fn wait_released(&self, container: &Container, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let expected = self
                .registry
                .lock()
                .iter()
                .filter(|w| !w.has_exited())
                .count();
            if container.len() >= expected {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    busy = expected.saturating_sub(container.len()),
                    "Timed out waiting for workers to be released"
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn destroy_workers(&self, workers: &[Worker]) {
        for worker in workers {
            worker.state().set(WorkerState::Destroyed);
            kill_logged(worker);
        }

        let reaped = futures::future::join_all(workers.iter().map(|w| w.wait()));
        if tokio::time::timeout(REAP_TIMEOUT, reaped).await.is_err() {
            warn!("Some workers were not reaped in time");
        }

        for worker in workers {
            worker.emit(EventKind::WorkerDestruct, "worker destroyed");
        }
    }

    /// Allocate a replacement, retrying until it succeeds or the pool stops
    async fn replace(watcher: Weak<Self>, generation: u64) {
        loop {
            let Some(this) = watcher.upgrade() else {
                return;
            };
            if this.stopped.load(Ordering::Acquire) {
                return;
            }

            match this.allocator.allocate().await {
                Ok(worker) => {
                    if let Some(stale) = Self::register_replacement(&this, worker, generation) {
                        debug!(pid = stale.pid(), "Discarding replacement worker");
                        stale.state().set(WorkerState::Destroyed);
                        kill_logged(&stale);
                    }
                    return;
                }
                Err(e) => {
                    this.events.push(Event::new(
                        EventKind::WorkerError,
                        format!("can't allocate the worker, retrying: {}", e),
                    ));
                }
            }

            drop(this);
            tokio::time::sleep(ALLOCATE_RETRY_INTERVAL).await;
        }
    }
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        for worker in self.registry.get_mut().drain(..) {
            worker.state().set(WorkerState::Destroyed);
            let _ = worker.kill();
        }
    }
}

/// Wait for a watched worker to exit, then restore capacity
async fn exit_watch(watcher: Weak<WatcherInner>, worker: Worker) {
    let exit = worker.wait().await;

    let Some(watcher) = watcher.upgrade() else {
        return;
    };

    let detail = exit
        .map(|e| e.to_string())
        .unwrap_or_else(|| "exit status unknown".to_string());
    worker.emit(EventKind::WorkerWaitExit, detail);

    watcher.unregister(worker.pid());
    worker.close_relay().await;

    if worker.state().get() == WorkerState::Destroyed || watcher.stopped.load(Ordering::Acquire) {
        return;
    }

    worker.state().set(WorkerState::Stopped);
    let generation = watcher.generation.load(Ordering::Acquire);
    let weak = Arc::downgrade(&watcher);
    drop(watcher);
    WatcherInner::replace(weak, generation).await;
}

fn kill_logged(worker: &Worker) {
    if let Err(e) = worker.kill() {
        warn!(pid = worker.pid(), "Failed to kill worker: {}", e);
    }
}
