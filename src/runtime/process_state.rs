// src/runtime/process_state.rs
//! Resource usage of worker processes
//!
//! Memory is read from `/proc/<pid>/status` (`VmRSS`), the resident set
//! of the process in bytes.

use crate::utils::errors::{PoolError, Result};
use serde::Serialize;

/// Point-in-time resource usage of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessState {
    pub pid: u32,

    /// Resident memory in bytes
    pub memory_usage: u64,
}

impl ProcessState {
    /// Resident memory in MiB, rounded down
    pub fn memory_mib(&self) -> u64 {
        self.memory_usage / (1024 * 1024)
    }
}

/// Sample the resource usage of `pid`
#[cfg(target_os = "linux")]
pub fn process_state(pid: u32) -> Result<ProcessState> {
    let path = format!("/proc/{}/status", pid);
    let status = std::fs::read_to_string(&path)
        .map_err(|e| PoolError::Process(format!("failed to read {}: {}", path, e)))?;

    let memory_usage = parse_vm_rss(&status)
        .ok_or_else(|| PoolError::Process(format!("no VmRSS entry in {}", path)))?;

    Ok(ProcessState { pid, memory_usage })
}

#[cfg(not(target_os = "linux"))]
pub fn process_state(pid: u32) -> Result<ProcessState> {
    Err(PoolError::Process(format!(
        "memory sampling is not supported on this platform (pid {})",
        pid
    )))
}

/// Extract `VmRSS` (reported in kB) from a status file, in bytes
///
/// Zombies and kernel threads have no `VmRSS` line.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tphp\nState:\tS (sleeping)\nVmPeak:\t  204800 kB\nVmRSS:\t   10240 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(10 * 1024 * 1024));
    }

    #[test]
    fn test_parse_vm_rss_missing() {
        assert_eq!(parse_vm_rss("Name:\tzombie\nState:\tZ (zombie)\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_process_state() {
        let state = process_state(std::process::id()).unwrap();
        assert!(state.memory_usage > 0);
        assert_eq!(state.memory_mib(), state.memory_usage / (1024 * 1024));
    }

    #[test]
    fn test_missing_process() {
        assert!(process_state(i32::MAX as u32).is_err());
    }
}
