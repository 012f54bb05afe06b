// src/runtime/worker.rs
//! A single worker process and its relay
//!
//! A [`Worker`] is a cheap, cloneable handle. The process itself is owned by
//! a background task that waits for it to exit and publishes the exit status;
//! everybody else observes that status through [`Worker::wait`].
//!
//! # State machine
//!
//! ```text
//! Inactive ──handshake──▶ Ready ◀──────────┐
//!                           │              │ success / soft error
//!                           ▼              │
//!                        Working ──────────┘
//!                           │
//!            ┌──────────────┼──────────────────┐
//!            ▼              ▼                  ▼
//!         Errored   Invalid (flagged)   MaxJobsReached
//!                           │                  │
//!                           ▼                  ▼
//!                  Killing ─▶ Stopped ◀─ Stopping
//!
//! Destroyed: terminal, set by pool shutdown; never left once entered
//! ```

use crate::events::{Event, EventBus, EventKind};
use crate::payload::Payload;
use crate::relay::{self, Frame, Relay, StopCommand};
use crate::runtime::process_manager::kill_process;
use crate::utils::errors::{PoolError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// How long a worker gets to exit after a stop request before it is killed
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the exit of a killed worker
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, handshake not completed
    Inactive = 0,
    /// Idle, may be taken
    Ready = 1,
    /// Executing a request
    Working = 2,
    /// Flagged for disposal on release
    Invalid = 3,
    /// Graceful stop in progress
    Stopping = 4,
    /// Kill in progress
    Killing = 5,
    /// Pool shutdown; never replaced
    Destroyed = 6,
    /// Execution budget exhausted
    MaxJobsReached = 7,
    /// Process gone
    Stopped = 8,
    /// Failed with an unclassified error
    Errored = 9,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Inactive,
            1 => WorkerState::Ready,
            2 => WorkerState::Working,
            3 => WorkerState::Invalid,
            4 => WorkerState::Stopping,
            5 => WorkerState::Killing,
            6 => WorkerState::Destroyed,
            7 => WorkerState::MaxJobsReached,
            8 => WorkerState::Stopped,
            _ => WorkerState::Errored,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Inactive => "inactive",
            WorkerState::Ready => "ready",
            WorkerState::Working => "working",
            WorkerState::Invalid => "invalid",
            WorkerState::Stopping => "stopping",
            WorkerState::Killing => "killing",
            WorkerState::Destroyed => "destroyed",
            WorkerState::MaxJobsReached => "max_jobs_reached",
            WorkerState::Stopped => "stopped",
            WorkerState::Errored => "errored",
        }
    }

    /// Ready or Working
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Working)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NOT_EXECUTING: u64 = u64::MAX;

/// Lock-free state, counters and timestamps of one worker
///
/// Timestamps are nanoseconds since the cell was created.
#[derive(Debug)]
pub struct WorkerStateCell {
    value: AtomicU8,
    num_execs: AtomicU64,
    origin: Instant,
    last_used: AtomicU64,
    exec_started: AtomicU64,
}

impl WorkerStateCell {
    pub fn new(state: WorkerState) -> Self {
        Self {
            value: AtomicU8::new(state as u8),
            num_execs: AtomicU64::new(0),
            origin: Instant::now(),
            last_used: AtomicU64::new(0),
            exec_started: AtomicU64::new(NOT_EXECUTING),
        }
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Unconditional transition, except that `Destroyed` is never left
    pub fn set(&self, state: WorkerState) {
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != WorkerState::Destroyed as u8).then_some(state as u8)
            });
    }

    /// Transition only if the current state is `from`
    pub fn compare_and_set(&self, from: WorkerState, to: WorkerState) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::Acquire)
    }

    /// Count a completed exchange, returns the new total
    pub fn register_exec(&self) -> u64 {
        self.num_execs.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn touch(&self) {
        self.last_used.store(self.now(), Ordering::Release);
    }

    /// Time since the worker was last used (or created)
    pub fn idle_for(&self) -> Duration {
        let last_used = self.last_used.load(Ordering::Acquire);
        Duration::from_nanos(self.now().saturating_sub(last_used))
    }

    /// Ready -> Working, stamping the start of the execution
    pub fn begin_exec(&self) -> std::result::Result<(), WorkerState> {
        if !self.compare_and_set(WorkerState::Ready, WorkerState::Working) {
            return Err(self.get());
        }
        let now = self.now();
        self.last_used.store(now, Ordering::Release);
        self.exec_started.store(now, Ordering::Release);
        Ok(())
    }

    pub fn end_exec(&self) {
        self.exec_started.store(NOT_EXECUTING, Ordering::Release);
        self.touch();
    }

    /// Duration of the execution in flight, if any
    pub fn exec_elapsed(&self) -> Option<Duration> {
        match self.exec_started.load(Ordering::Acquire) {
            NOT_EXECUTING => None,
            started => Some(Duration::from_nanos(self.now().saturating_sub(started))),
        }
    }

    /// Time since the cell was created
    pub fn age(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => match nix::sys::signal::Signal::try_from(signal) {
                Ok(sig) => write!(f, "killed by signal {}", sig),
                Err(_) => write!(f, "killed by signal {}", signal),
            },
            (None, None) => f.write_str("exited for an unknown reason"),
        }
    }
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub pid: u32,
    pub state: WorkerState,
    pub num_execs: u64,
    pub created: DateTime<Utc>,

    /// Time since the worker was last used
    pub idle: Duration,

    /// Duration of the execution in flight
    pub exec_elapsed: Option<Duration>,
}

struct WorkerInner {
    pid: u32,
    created: DateTime<Utc>,
    state: WorkerStateCell,
    relay: AsyncMutex<Box<dyn Relay>>,
    exit: watch::Receiver<Option<ExitInfo>>,
    events: Arc<EventBus>,
}

impl WorkerInner {
    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            pid: self.pid,
            state: self.state.get(),
            num_execs: self.state.num_execs(),
            created: self.created,
            idle: self.state.idle_for(),
            exec_elapsed: self.state.exec_elapsed(),
        }
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        // last handle gone while the process still runs
        if !self.has_exited() {
            debug!(pid = self.pid, "Killing unreferenced worker");
            let _ = kill_process(self.pid);
        }
    }
}

/// Handle to a worker process
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Attach to a spawned child and run the pid handshake over `relay`
    ///
    /// On failure the child is killed before the error is returned.
    pub async fn start(child: Child, relay: Box<dyn Relay>, events: Arc<EventBus>) -> Result<Worker> {
        let worker = Self::attach(child, relay, events)?;

        if let Err(e) = worker.handshake().await {
            if let Err(kill_err) = worker.kill() {
                warn!(pid = worker.pid(), "Failed to kill worker after handshake error: {}", kill_err);
            }
            let _ = tokio::time::timeout(KILL_WAIT, worker.wait()).await;
            return Err(match e {
                PoolError::WorkerAllocate(_) => e,
                other => PoolError::WorkerAllocate(format!("handshake failed: {}", other)),
            });
        }

        Ok(worker)
    }

    /// Take ownership of the child process; the worker starts `Inactive`
    fn attach(mut child: Child, relay: Box<dyn Relay>, events: Arc<EventBus>) -> Result<Worker> {
        let pid = child
            .id()
            .ok_or_else(|| PoolError::Process("child exited before it was attached".to_string()))?;
        let stderr = child.stderr.take();
        let (exit_tx, exit_rx) = watch::channel(None);

        let inner = Arc::new(WorkerInner {
            pid,
            created: Utc::now(),
            state: WorkerStateCell::new(WorkerState::Inactive),
            relay: AsyncMutex::new(relay),
            exit: exit_rx,
            events,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(pid, "Failed to wait for worker: {}", e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            exit_tx.send_replace(Some(exit));

            // a live worker dying on its own is an error
            if let Some(inner) = weak.upgrade() {
                if !inner.state.compare_and_set(WorkerState::Ready, WorkerState::Errored) {
                    inner.state.compare_and_set(WorkerState::Working, WorkerState::Errored);
                }
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr, Arc::downgrade(&inner)));
        }

        Ok(Worker { inner })
    }

    async fn handshake(&self) -> Result<()> {
        let reported = {
            let mut relay = self.inner.relay.lock().await;
            relay::fetch_pid(&mut **relay).await?
        };

        if reported != self.pid() {
            return Err(PoolError::WorkerAllocate(format!(
                "pid mismatch: spawned {} but worker reported {}",
                self.pid(),
                reported
            )));
        }

        self.inner.state.touch();
        self.inner
            .state
            .compare_and_set(WorkerState::Inactive, WorkerState::Ready);
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn state(&self) -> &WorkerStateCell {
        &self.inner.state
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.inner.created
    }

    pub fn info(&self) -> WorkerInfo {
        self.inner.info()
    }

    /// Push an event concerning this worker
    pub(crate) fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.inner
            .events
            .push(Event::for_worker(kind, self.info(), message));
    }

    /// Exit status, once the process has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.inner.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.inner.has_exited()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut exit = self.inner.exit.clone();
        let result = exit.wait_for(Option::is_some).await;
        match result {
            Ok(status) => *status,
            Err(_) => *self.inner.exit.borrow(),
        }
    }

    /// Send one request and read the response
    ///
    /// The worker must be `Ready`. An application error keeps the worker in
    /// service; any other failure leaves it `Errored`.
    pub async fn exec(&self, payload: &Payload) -> Result<Payload> {
        if payload.is_empty() {
            return Err(PoolError::EmptyPayload);
        }

        let state = &self.inner.state;
        state.begin_exec().map_err(PoolError::WorkerNotReady)?;

        let result = {
            let mut relay = self.inner.relay.lock().await;
            exchange(&mut **relay, payload).await
        };

        state.end_exec();
        state.register_exec();

        match result {
            Ok(response) => {
                state.compare_and_set(WorkerState::Working, WorkerState::Ready);
                Ok(response)
            }
            Err(e) if e.is_soft_job() => {
                state.compare_and_set(WorkerState::Working, WorkerState::Ready);
                Err(e)
            }
            Err(e) => {
                state.set(WorkerState::Errored);
                Err(e)
            }
        }
    }

    /// [`exec`](Self::exec) bounded by `ttl`
    ///
    /// On expiry the worker is killed and [`PoolError::ExecTtl`] returned.
    pub async fn exec_with_ttl(&self, ttl: Duration, payload: &Payload) -> Result<Payload> {
        match tokio::time::timeout(ttl, self.exec(payload)).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.state.end_exec();
                self.inner.state.set(WorkerState::Invalid);

                if let Err(e) = self.kill() {
                    warn!(pid = self.pid(), "Failed to kill worker after exec TTL: {}", e);
                }
                let _ = tokio::time::timeout(KILL_WAIT, self.wait()).await;

                Err(PoolError::ExecTtl(ttl))
            }
        }
    }

    /// Ask the worker to exit, killing it after [`STOP_TIMEOUT`]
    pub async fn stop(&self) -> Result<()> {
        if self.has_exited() {
            self.inner.state.set(WorkerState::Stopped);
            return Ok(());
        }

        self.inner.state.set(WorkerState::Stopping);

        let sent = match Frame::control(&StopCommand { stop: true }) {
            Ok(frame) => {
                let mut relay = self.inner.relay.lock().await;
                relay.send(frame).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            self.kill()?;
            return Err(e);
        }

        if tokio::time::timeout(STOP_TIMEOUT, self.wait()).await.is_err() {
            warn!(pid = self.pid(), "Worker ignored stop request, killing");
            self.kill()?;
            return Ok(());
        }

        self.inner.state.set(WorkerState::Stopped);
        Ok(())
    }

    /// SIGKILL the process; does nothing once it has exited
    pub fn kill(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        let state = &self.inner.state;
        state.set(WorkerState::Killing);
        kill_process(self.pid())?;
        state.set(WorkerState::Stopped);
        Ok(())
    }

    /// Close the pool side of the relay
    pub async fn close_relay(&self) {
        let mut relay = self.inner.relay.lock().await;
        if let Err(e) = relay.close().await {
            debug!(pid = self.pid(), "Relay close failed: {}", e);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid())
            .field("state", &self.inner.state.get())
            .field("num_execs", &self.inner.state.num_execs())
            .finish()
    }
}

/// One request/response exchange
async fn exchange(relay: &mut dyn Relay, payload: &Payload) -> Result<Payload> {
    relay.send(Frame::from(payload)).await?;

    let frame = relay
        .receive()
        .await?
        .ok_or_else(|| PoolError::Network("worker closed the relay".to_string()))?;

    if frame.is_error() {
        return Err(PoolError::SoftJob(
            String::from_utf8_lossy(&frame.body).into_owned(),
        ));
    }

    if frame.is_control() {
        return Err(PoolError::Decode(
            "unexpected control frame in response".to_string(),
        ));
    }

    Ok(frame.into_payload())
}

async fn forward_stderr(stderr: ChildStderr, worker: Weak<WorkerInner>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(inner) = worker.upgrade() else {
                    break;
                };
                inner
                    .events
                    .push(Event::for_worker(EventKind::WorkerLog, inner.info(), line));
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Worker stderr closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Ready.to_string(), "ready");
        assert_eq!(WorkerState::MaxJobsReached.to_string(), "max_jobs_reached");
        for value in 0..10u8 {
            assert_eq!(WorkerState::from_u8(value) as u8, value);
        }
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let cell = WorkerStateCell::new(WorkerState::Ready);
        cell.set(WorkerState::Destroyed);
        cell.set(WorkerState::Stopped);
        assert_eq!(cell.get(), WorkerState::Destroyed);
        assert!(!cell.compare_and_set(WorkerState::Ready, WorkerState::Working));
    }

    #[test]
    fn test_begin_exec_requires_ready() {
        let cell = WorkerStateCell::new(WorkerState::Invalid);
        assert_eq!(cell.begin_exec(), Err(WorkerState::Invalid));

        cell.set(WorkerState::Ready);
        assert!(cell.begin_exec().is_ok());
        assert_eq!(cell.get(), WorkerState::Working);
        assert!(cell.exec_elapsed().is_some());

        cell.end_exec();
        assert!(cell.exec_elapsed().is_none());
    }

    #[test]
    fn test_exec_counter() {
        let cell = WorkerStateCell::new(WorkerState::Ready);
        assert_eq!(cell.register_exec(), 1);
        assert_eq!(cell.register_exec(), 2);
        assert_eq!(cell.num_execs(), 2);
    }

    #[test]
    fn test_idle_for_grows() {
        let cell = WorkerStateCell::new(WorkerState::Ready);
        cell.touch();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cell.idle_for() >= Duration::from_millis(5));

        cell.touch();
        assert!(cell.idle_for() < Duration::from_millis(5));
    }

    #[test]
    fn test_exit_info_display() {
        let exited = ExitInfo {
            code: Some(3),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exited with code 3");
        assert!(!exited.success());

        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal SIGKILL");
    }
}
