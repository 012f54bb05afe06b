// src/runtime/process_manager.rs
//! Worker command construction and process signalling
//!
//! The pool never spawns a fixed program: a [`CommandFactory`] produces a
//! fresh [`CommandSpec`] for every worker it needs.

use crate::utils::errors::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Everything needed to start one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute
    pub program: PathBuf,

    /// Arguments
    pub args: Vec<OsString>,

    /// Extra environment variables
    pub env_vars: Vec<(OsString, OsString)>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Run as this user id
    pub uid: Option<u32>,

    /// Run as this group id
    pub gid: Option<u32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            work_dir: None,
            uid: None,
            gid: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn user(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn group(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Build the tokio command
    ///
    /// The child is killed if its handle is dropped before the worker is
    /// fully attached, so an abandoned spawn never leaves a process behind.
    /// Stdio is left for the relay factory to configure.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);

        if let Some(work_dir) = &self.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &self.env_vars {
            command.env(key, value);
        }

        if let Some(uid) = self.uid {
            command.uid(uid);
        }

        if let Some(gid) = self.gid {
            command.gid(gid);
        }

        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Produces the command for each new worker
pub trait CommandFactory: Send + Sync {
    fn command(&self) -> CommandSpec;
}

impl<F> CommandFactory for F
where
    F: Fn() -> CommandSpec + Send + Sync,
{
    fn command(&self) -> CommandSpec {
        self()
    }
}

impl CommandFactory for CommandSpec {
    fn command(&self) -> CommandSpec {
        self.clone()
    }
}

/// Send SIGKILL to a process; a process that is already gone is not an error
pub fn kill_process(pid: u32) -> Result<()> {
    debug!("Sending SIGKILL to PID {}", pid);
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Check if a process exists
pub fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
