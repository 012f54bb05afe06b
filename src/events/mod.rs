// src/events/mod.rs
//! Lifecycle events
//!
//! The pool, the watcher and the supervisor push events to an [`EventBus`];
//! listeners registered with [`crate::Pool::add_listener`] receive every
//! event synchronously, in push order. Every event is also logged through
//! `tracing` and counted through `metrics`.

use crate::observability::names;
use crate::runtime::worker::WorkerInfo;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new worker was spawned and passed the handshake
    WorkerConstruct,
    /// A worker was destroyed and will not be replaced
    WorkerDestruct,
    /// A line written by a worker to its stderr
    WorkerLog,
    /// A worker failed (soft job error, allocation retry, stop failure)
    WorkerError,
    /// A watched worker process exited
    WorkerWaitExit,
    /// Pool-wide error
    PoolError,
    /// The pool was reset
    PoolRestart,
    /// The supervisor could not complete a tick
    SupervisorError,
    /// No worker was freed within the allocate timeout
    NoFreeWorkers,
    /// A worker exceeded its memory limit
    MaxMemory,
    /// A worker exceeded its lifetime
    Ttl,
    /// A worker stayed idle for too long
    IdleTtl,
    /// An execution exceeded its deadline
    ExecTtl,
    /// A worker reached its execution budget
    MaxJobsReached,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkerConstruct => "worker_construct",
            EventKind::WorkerDestruct => "worker_destruct",
            EventKind::WorkerLog => "worker_log",
            EventKind::WorkerError => "worker_error",
            EventKind::WorkerWaitExit => "worker_wait_exit",
            EventKind::PoolError => "pool_error",
            EventKind::PoolRestart => "pool_restart",
            EventKind::SupervisorError => "supervisor_error",
            EventKind::NoFreeWorkers => "no_free_workers",
            EventKind::MaxMemory => "max_memory",
            EventKind::Ttl => "ttl",
            EventKind::IdleTtl => "idle_ttl",
            EventKind::ExecTtl => "exec_ttl",
            EventKind::MaxJobsReached => "max_jobs_reached",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,

    /// Snapshot of the worker concerned, if any
    pub worker: Option<WorkerInfo>,

    /// Human-readable detail (log line, error message)
    pub message: String,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            worker: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_worker(kind: EventKind, worker: WorkerInfo, message: impl Into<String>) -> Self {
        Self {
            worker: Some(worker),
            ..Self::new(kind, message)
        }
    }

    /// Pid of the worker concerned, if any
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.pid)
    }
}

/// Observer of lifecycle events
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Synchronous fan-out of events to registered listeners
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    pushed: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it receives every event pushed afterwards
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Log, count and dispatch an event
    pub fn push(&self, event: Event) {
        log_event(&event);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::EVENTS_TOTAL, "kind" => event.kind.as_str()).increment(1);

        // clone the list so listeners may register other listeners
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    /// Total number of events pushed
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("pushed", &self.pushed())
            .finish()
    }
}

fn log_event(event: &Event) {
    let pid = event.pid();
    let kind = event.kind.as_str();

    match event.kind {
        EventKind::WorkerLog => {
            debug!(pid, kind, "{}", event.message)
        }
        EventKind::WorkerConstruct | EventKind::WorkerWaitExit => {
            debug!(pid, kind, message = %event.message, "worker event")
        }
        EventKind::WorkerDestruct | EventKind::PoolRestart => {
            info!(pid, kind, message = %event.message, "pool event")
        }
        EventKind::PoolError | EventKind::SupervisorError => {
            error!(pid, kind, message = %event.message, "pool error")
        }
        _ => warn!(pid, kind, message = %event.message, "worker event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_fan_out_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.add_listener(Arc::new(move |event: &Event| sink.lock().push(event.kind)));

        bus.push(Event::new(EventKind::WorkerConstruct, "spawned"));
        bus.push(Event::new(EventKind::Ttl, "too old"));

        assert_eq!(*seen.lock(), vec![EventKind::WorkerConstruct, EventKind::Ttl]);
        assert_eq!(bus.pushed(), 2);
    }

    #[test]
    fn test_multiple_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.add_listener(Arc::new(move |_: &Event| {
                count.fetch_add(1, Ordering::Relaxed);
            }));
        }

        bus.push(Event::new(EventKind::PoolRestart, "reset"));
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(bus.listener_count(), 3);
    }

    #[test]
    fn test_event_without_worker() {
        let event = Event::new(EventKind::NoFreeWorkers, "timeout");
        assert_eq!(event.pid(), None);
        assert_eq!(event.kind.to_string(), "no_free_workers");
    }
}
