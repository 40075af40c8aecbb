//! # overseer-exec
//!
//! Process supervision for overseer.
//! Creates, controls and observes external processes the same way no matter
//! where they run.
//!
//! ## Features
//!
//! - One `Executor` contract over four backends (local, Docker, SSH, tunnel)
//! - Monotonic lifecycle status shared by every backend
//! - Declarative `Create` options resolved into configured executors
//! - Timeouts enforced through context deadlines
//! - Output routing with logger fan-out and redirect-cycle validation

pub mod executor;
pub mod io;
pub mod options;
pub mod signal;
pub mod status;

// Executors
pub use executor::{
    DockerExecutor, Executor, LocalExecutor, ResolveExecutor, SshClient, SshConnection, SshDialer,
    SshExecutor, SshExit, SshSession, SshStdio, TunnelClient, TunnelCommand, TunnelDialer,
    TunnelExecutor, TunnelProcess,
};
pub use io::{InputReader, OutputWriter, SharedBuffer};
pub use signal::Signal;
pub use status::{Status, StatusCell};

// Options
pub use options::{
    CachedLogger, Create, Docker, InMemoryLog, LogEntry, LogLevel, LoggerConfig, LoggerType,
    Output, ProcessImplementation, Remote, Sender, SenderWriter,
};

// Foundation re-exports
pub use overseer_foundation::{Context, Error, ErrorCollector, Result};
