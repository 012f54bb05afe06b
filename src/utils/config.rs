// src/utils/config.rs
//! Pool configuration
//!
//! Configuration is an explicit, immutable value handed to the pool
//! constructor. It can be built in code or loaded from a file with
//! `RELAY_POOL__*` environment overrides:
//!
//! ```toml
//! num_workers = 4
//! max_jobs = 1000
//! allocate_timeout = "60s"
//! destroy_timeout = "60s"
//!
//! [supervisor]
//! watch_tick = "1s"
//! ttl = "1h"
//! idle_ttl = "10m"
//! exec_ttl = "30s"
//! max_worker_memory = 256
//! ```

use crate::utils::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default time to wait for a worker to be spawned or freed
pub const DEFAULT_ALLOCATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default grace period for pool-wide shutdown
pub const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default supervisor tick
pub const DEFAULT_WATCH_TICK: Duration = Duration::from_secs(1);

/// Default bound on transparent re-issues after a worker asks to be restarted
pub const DEFAULT_MAX_RESTART_RETRIES: usize = 3;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "RELAY_POOL";

/// Configures the pool behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Debug mode spawns a fresh worker for every request
    pub debug: bool,

    /// Number of worker processes (0 = number of CPUs)
    pub num_workers: usize,

    /// Executions allowed per worker before it is replaced (0 = unlimited)
    pub max_jobs: u64,

    /// How long to wait for a worker to be spawned or freed
    #[serde(with = "duration_format")]
    pub allocate_timeout: Duration,

    /// Grace period for in-flight workers during destroy
    #[serde(with = "duration_format")]
    pub destroy_timeout: Duration,

    /// Re-issues allowed when a worker answers with a restart request
    pub max_restart_retries: usize,

    /// Optional supervision limits
    pub supervisor: Option<SupervisorConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            debug: false,
            num_workers: num_cpus(),
            max_jobs: 0,
            allocate_timeout: DEFAULT_ALLOCATE_TIMEOUT,
            destroy_timeout: DEFAULT_DESTROY_TIMEOUT,
            max_restart_retries: DEFAULT_MAX_RESTART_RETRIES,
            supervisor: None,
        }
    }
}

impl PoolConfig {
    /// Load configuration from a file, applying environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::finish(settings.try_deserialize()?)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;

        Self::finish(settings.try_deserialize()?)
    }

    fn finish(mut cfg: PoolConfig) -> Result<Self> {
        cfg.init_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace zero values with defaults and apply debug mode overrides
    pub fn init_defaults(&mut self) {
        if self.num_workers == 0 {
            self.num_workers = num_cpus();
        }

        if self.allocate_timeout.is_zero() {
            self.allocate_timeout = DEFAULT_ALLOCATE_TIMEOUT;
        }

        if self.destroy_timeout.is_zero() {
            self.destroy_timeout = DEFAULT_DESTROY_TIMEOUT;
        }

        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.init_defaults();
        }

        // no persistent pool in debug mode
        if self.debug {
            self.num_workers = 0;
            self.max_jobs = 1;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.debug && self.num_workers == 0 {
            return Err(PoolError::Config("num_workers cannot be 0".to_string()));
        }

        if let Some(supervisor) = &self.supervisor {
            supervisor.validate()?;
        }

        Ok(())
    }
}

/// Supervision limits; a zero value disables the corresponding check
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often the workers are inspected
    #[serde(with = "duration_format")]
    pub watch_tick: Duration,

    /// Maximum lifetime of a worker
    #[serde(with = "duration_format")]
    pub ttl: Duration,

    /// Maximum time a worker may stay idle
    #[serde(with = "duration_format")]
    pub idle_ttl: Duration,

    /// Maximum duration of a single execution
    #[serde(with = "duration_format")]
    pub exec_ttl: Duration,

    /// Resident memory limit per worker in MiB
    pub max_worker_memory: u64,
}

impl SupervisorConfig {
    pub fn init_defaults(&mut self) {
        if self.watch_tick.is_zero() {
            self.watch_tick = DEFAULT_WATCH_TICK;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch_tick.is_zero() {
            return Err(PoolError::Config("watch_tick cannot be 0".to_string()));
        }
        if self.max_worker_memory.checked_mul(BYTES_PER_MIB).is_none() {
            return Err(PoolError::Config(format!(
                "max_worker_memory of {} MiB is out of range",
                self.max_worker_memory
            )));
        }
        Ok(())
    }

    /// Memory limit in bytes, if enabled
    pub fn max_worker_memory_bytes(&self) -> Option<u64> {
        if self.max_worker_memory == 0 {
            return None;
        }
        // out of range values are rejected by validate
        Some(self.max_worker_memory.saturating_mul(BYTES_PER_MIB))
    }
}

const BYTES_PER_MIB: u64 = 1024 * 1024;

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parse a duration such as `500ms`, `10s`, `5m` or a bare number of seconds
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", text))?;

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ns" => Ok(Duration::from_nanos(value)),
        "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => scaled(value, 60, text),
        "h" => scaled(value, 3600, text),
        other => Err(format!("unknown duration unit '{}' in '{}'", other, text)),
    }
}

fn scaled(value: u64, secs_per_unit: u64, text: &str) -> std::result::Result<Duration, String> {
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is out of range", text))
}

/// Format a duration in the largest unit that represents it exactly
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        "0s".to_string()
    } else if nanos % 1_000_000_000 == 0 {
        format!("{}s", duration.as_secs())
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else if nanos % 1_000 == 0 {
        format!("{}us", duration.as_micros())
    } else {
        format!("{}ns", nanos)
    }
}

mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1ns").unwrap(), Duration::from_nanos(1));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range() {
        let huge = format!("{}h", u64::MAX / 1000);
        assert!(parse_duration(&huge).unwrap_err().contains("out of range"));
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
    }

    #[test]
    fn test_memory_limit_out_of_range() {
        let supervisor = SupervisorConfig {
            max_worker_memory: u64::MAX,
            ..Default::default()
        };
        assert!(supervisor.max_worker_memory_bytes().is_some());

        let cfg = PoolConfig {
            supervisor: Some(SupervisorConfig {
                watch_tick: Duration::from_secs(1),
                ..supervisor
            }),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, PoolError::Config(ref msg) if msg.contains("out of range")));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(60)), "60s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_nanos(7)), "7ns");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_init_defaults() {
        let mut cfg = PoolConfig {
            num_workers: 0,
            allocate_timeout: Duration::ZERO,
            destroy_timeout: Duration::ZERO,
            supervisor: Some(SupervisorConfig::default()),
            ..Default::default()
        };
        cfg.init_defaults();

        assert!(cfg.num_workers >= 1);
        assert_eq!(cfg.allocate_timeout, DEFAULT_ALLOCATE_TIMEOUT);
        assert_eq!(cfg.destroy_timeout, DEFAULT_DESTROY_TIMEOUT);
        assert_eq!(cfg.supervisor.unwrap().watch_tick, DEFAULT_WATCH_TICK);
    }

    #[test]
    fn test_debug_mode_overrides() {
        let mut cfg = PoolConfig {
            debug: true,
            num_workers: 8,
            max_jobs: 100,
            ..Default::default()
        };
        cfg.init_defaults();

        assert_eq!(cfg.num_workers, 0);
        assert_eq!(cfg.max_jobs, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let cfg = PoolConfig::from_toml(
            r#"
            num_workers = 2
            max_jobs = 10
            allocate_timeout = "250ms"

            [supervisor]
            ttl = "1m"
            exec_ttl = 5
            max_worker_memory = 128
            "#,
        )
        .unwrap();

        assert_eq!(cfg.num_workers, 2);
        assert_eq!(cfg.max_jobs, 10);
        assert_eq!(cfg.allocate_timeout, Duration::from_millis(250));
        assert_eq!(cfg.destroy_timeout, DEFAULT_DESTROY_TIMEOUT);

        let supervisor = cfg.supervisor.unwrap();
        assert_eq!(supervisor.watch_tick, DEFAULT_WATCH_TICK);
        assert_eq!(supervisor.ttl, Duration::from_secs(60));
        assert_eq!(supervisor.idle_ttl, Duration::ZERO);
        assert_eq!(supervisor.exec_ttl, Duration::from_secs(5));
        assert_eq!(supervisor.max_worker_memory_bytes(), Some(128 * 1024 * 1024));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "num_workers = 3\ndestroy_timeout = \"2s\"").unwrap();

        let cfg = PoolConfig::load(file.path()).unwrap();
        assert_eq!(cfg.num_workers, 3);
        assert_eq!(cfg.destroy_timeout, Duration::from_secs(2));
        assert!(cfg.supervisor.is_none());
    }

    #[test]
    fn test_memory_limit_disabled_when_zero() {
        let supervisor = SupervisorConfig::default();
        assert_eq!(supervisor.max_worker_memory_bytes(), None);
    }
}
