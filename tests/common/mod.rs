// tests/common/mod.rs
//! Shared helpers for pool integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use relay_pool::{CommandSpec, Event, EventKind, EventListener, PoolConfig};
use std::sync::Arc;
use std::time::Duration;

/// Command running the reference worker in `mode`
pub fn worker(args: &[&str]) -> CommandSpec {
    CommandSpec::new(env!("CARGO_BIN_EXE_relay-worker")).args(args.iter().copied())
}

pub fn config(num_workers: usize) -> PoolConfig {
    PoolConfig {
        num_workers,
        allocate_timeout: Duration::from_secs(10),
        destroy_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Poll `check` every 20ms until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Running and not a zombie
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // state is the first field after the parenthesised command name
        Ok(stat) => match stat.rfind(')') {
            Some(end) => !stat[end + 1..].trim_start().starts_with('Z'),
            None => true,
        },
        Err(_) => false,
    }
}

/// Listener collecting every event
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub fn has(&self, kind: EventKind) -> bool {
        self.events.lock().iter().any(|e| e.kind == kind)
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl EventListener for Recorder {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}
