// src/utils/mod.rs
//! Shared utilities: configuration and errors

pub mod config;
pub mod errors;

pub use config::{PoolConfig, SupervisorConfig};
pub use errors::{PoolError, Result};
