//! Executor trait

use crate::io::{InputReader, OutputWriter};
use crate::signal::Signal;
use crate::status::Status;
use async_trait::async_trait;
use futures::future::BoxFuture;
use overseer_foundation::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Executor trait - implement to add new execution backends
///
/// All methods take `&self` so one task may block in [`Executor::wait`]
/// while another delivers a signal. Setters are meant to be called before
/// [`Executor::start`]; changes made afterwards are not observed.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Argument vector, program first
    fn args(&self) -> Vec<String>;

    /// Environment as `KEY=VALUE` entries
    fn env(&self) -> Vec<String>;

    fn set_env(&self, env: Vec<String>);

    fn dir(&self) -> Option<PathBuf>;

    fn set_dir(&self, dir: PathBuf);

    fn set_stdin(&self, input: InputReader);

    fn stdout(&self) -> OutputWriter;

    fn set_stdout(&self, writer: OutputWriter);

    fn stderr(&self) -> OutputWriter;

    fn set_stderr(&self, writer: OutputWriter);

    /// Current lifecycle status
    fn status(&self) -> Status;

    /// Launch the process. Fails if already started.
    async fn start(&self) -> Result<()>;

    /// Block until the process exits or the executor's context is done.
    ///
    /// A non-zero exit or signal death is reported as an error.
    async fn wait(&self) -> Result<()>;

    /// Deliver a signal to a running process
    async fn signal(&self, sig: Signal) -> Result<()>;

    /// Process ID, or -1 when not retrievable
    async fn pid(&self) -> i32;

    /// Exit code, or -1 when not retrievable
    fn exit_code(&self) -> i32;

    /// Whether the process exited cleanly. Only meaningful after `wait`.
    fn success(&self) -> bool;

    /// Signal associated with the process, if any
    fn signal_info(&self) -> Option<Signal>;

    /// Release native resources
    async fn close(&self) -> Result<()>;
}

/// Constructor for a backend-specific executor
pub type ResolveExecutor = Arc<
    dyn Fn(Context, Vec<String>) -> BoxFuture<'static, Result<Arc<dyn Executor>>> + Send + Sync,
>;
