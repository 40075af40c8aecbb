//! Process executors
//!
//! Provides multiple execution backends behind the [`Executor`] trait:
//! - `LocalExecutor` - native OS process
//! - `DockerExecutor` - process running in a Docker container
//! - `SshExecutor` - process started over an SSH session
//! - `TunnelExecutor` - process started through a WebSocket exec tunnel

pub mod docker;
pub mod local;
pub mod ssh;
pub mod tunnel;
pub mod r#trait;

pub use docker::DockerExecutor;
pub use local::LocalExecutor;
pub use r#trait::{Executor, ResolveExecutor};
pub use ssh::{SshClient, SshConnection, SshDialer, SshExecutor, SshExit, SshSession, SshStdio};
pub use tunnel::{TunnelClient, TunnelCommand, TunnelDialer, TunnelExecutor, TunnelProcess};

use crate::io::{InputReader, OutputWriter};
use crate::signal::Signal;
use overseer_foundation::{Error, Result};
use std::path::PathBuf;

/// Settings a remote-style backend collects before start
#[derive(Default)]
pub(crate) struct ProcessConfig {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: Option<PathBuf>,
    pub stdin: Option<InputReader>,
    pub stdout: OutputWriter,
    pub stderr: OutputWriter,
}

impl ProcessConfig {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    pub fn has_io(&self) -> bool {
        self.stdin.is_some() || !self.stdout.is_discard() || !self.stderr.is_discard()
    }
}

/// Observed facts about a process; -1 means not known yet
#[derive(Debug, Clone)]
pub(crate) struct ProcessOutcome {
    pub pid: i32,
    pub exit_code: i32,
    pub signal: Option<Signal>,
    pub result: Option<Result<()>>,
}

impl Default for ProcessOutcome {
    fn default() -> Self {
        Self {
            pid: -1,
            exit_code: -1,
            signal: None,
            result: None,
        }
    }
}

impl ProcessOutcome {
    /// Record an exit code and derive the wait result from it
    pub fn record_exit(&mut self, code: i32) -> Result<()> {
        self.exit_code = code;
        let result = if code == 0 {
            Ok(())
        } else {
            Err(Error::Exit { code })
        };
        self.result = Some(result.clone());
        result
    }

    pub fn cached_result(&self) -> Result<()> {
        self.result
            .clone()
            .unwrap_or_else(|| Err(Error::lifecycle("process has no recorded outcome")))
    }
}
