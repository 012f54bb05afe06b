// src/runtime/mod.rs
//! Worker execution runtime
//!
//! This module provides the worker pool, including:
//!
//! - **Worker**: One process, its relay and its state machine
//! - **Allocator**: Spawns workers and waits for their handshake
//! - **Watcher**: Free-list, registry and automatic replacement
//! - **Pool**: Request execution and failure classification
//! - **Supervisor**: TTL, idle, memory and execution time limits
//! - **Process Manager**: Worker commands and signals
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 SupervisedPool (optional)               │
//! │   watch_tick ─▶ ttl / memory / idle_ttl / exec_ttl      │
//! │  ┌───────────────────────────────────────────────────┐  │
//! │  │                   StaticPool                      │  │
//! │  │   exec ─▶ take ─▶ Worker ─▶ relay ─▶ release      │  │
//! │  │  ┌─────────────────────────────────────────────┐  │  │
//! │  │  │              WorkerWatcher                  │  │  │
//! │  │  │  free-list ◀─▶ registry ◀─ exit watch       │  │  │
//! │  │  │                    │                        │  │  │
//! │  │  │                Allocator                    │  │  │
//! │  │  └─────────────────────────────────────────────┘  │  │
//! │  └───────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod pool;
pub mod process_manager;
pub mod process_state;
pub mod supervisor;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use allocator::Allocator;
pub use pool::{new_pool, new_pool_with_events, Pool, StaticPool};
pub use process_manager::{CommandFactory, CommandSpec};
pub use process_state::{process_state, ProcessState};
pub use supervisor::SupervisedPool;
pub use watcher::WorkerWatcher;
pub use worker::{ExitInfo, Worker, WorkerInfo, WorkerState};
