// src/lib.rs
//! Relay Pool Library
//!
//! A pool of long-lived worker processes that serve request/response
//! payloads over a framed relay (pipes or a Unix socket), with automatic
//! replacement of dead workers and optional supervision of lifetime,
//! idle time, execution time and memory.
//!
//! # Architecture
//!
//! - **runtime**: Workers, allocation, the watcher, the pool and the supervisor
//! - **relay**: Frame codec and transports, plus the worker-side responder
//! - **events**: Lifecycle events and listeners
//! - **observability**: Tracing setup and metric names
//! - **utils**: Configuration and errors
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> relay_pool::Result<()> {
//! use relay_pool::{new_pool, CommandSpec, Payload, PipeFactory, PoolConfig};
//! use std::sync::Arc;
//!
//! let cfg = PoolConfig {
//!     num_workers: 4,
//!     ..Default::default()
//! };
//! let pool = new_pool(CommandSpec::new("my-worker"), Arc::new(PipeFactory::new()), cfg).await?;
//!
//! let response = pool.exec(&Payload::new("hello")).await?;
//! println!("{}", response.body_str());
//!
//! pool.destroy(pool.config().destroy_timeout).await;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod events;
pub mod observability;
pub mod payload;
pub mod relay;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use events::{Event, EventKind, EventListener};
pub use payload::Payload;
pub use relay::{PipeFactory, RelayFactory, Responder, SocketFactory};
pub use runtime::{
    new_pool, new_pool_with_events, CommandFactory, CommandSpec, Pool, SupervisedPool,
    StaticPool, WorkerInfo, WorkerState,
};
pub use utils::config::{PoolConfig, SupervisorConfig};
pub use utils::errors::{PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
