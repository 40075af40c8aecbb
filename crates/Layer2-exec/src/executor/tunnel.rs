//! Tunnel executor - runs a process through a WebSocket exec tunnel
//!
//! The tunnel protocol can start commands and stream their I/O but has no
//! signal primitive, so signals are delivered by running `kill` through the
//! same tunnel against the remote PID.

use crate::executor::{Executor, ProcessConfig, ProcessOutcome, ResolveExecutor};
use crate::io::{copy_from_reader, copy_to_writer, InputReader, OutputWriter};
use crate::signal::Signal;
use crate::status::{Status, StatusCell};
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use overseer_foundation::{Context, Error, ErrorCollector, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type TunnelWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type TunnelReader = Box<dyn AsyncRead + Send + Unpin>;

/// A command to start on the far side of the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelCommand {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Whether the caller will write to standard input
    pub stdin: bool,
}

/// Client side of the exec tunnel
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn start_command(&self, command: TunnelCommand) -> Result<Box<dyn TunnelProcess>>;

    async fn close(&self) -> Result<()>;
}

/// Opens a tunnel client for a single executor
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn TunnelClient>>;
}

/// A command running on the far side of the tunnel
#[async_trait]
pub trait TunnelProcess: Send {
    /// PID reported by the remote side
    fn pid(&self) -> i32;

    fn take_stdin(&mut self) -> Option<TunnelWriter>;

    fn take_stdout(&mut self) -> Option<TunnelReader>;

    fn take_stderr(&mut self) -> Option<TunnelReader>;

    /// Block until exit; `None` when the remote side reports no code
    async fn wait(&mut self) -> Result<Option<i32>>;
}

struct RunningCommand {
    process: Box<dyn TunnelProcess>,
    copies: Vec<JoinHandle<Result<u64>>>,
}

enum WaitEvent {
    Exited(Result<Option<i32>>),
    Done(Error),
}

/// Executor backed by a tunnel exec client
///
/// The executor owns its client and closes it on `close` or after a failed
/// `start`. Executors must not share a client.
pub struct TunnelExecutor {
    ctx: Context,
    client: Arc<dyn TunnelClient>,
    config: Mutex<ProcessConfig>,
    status: StatusCell,
    running: tokio::sync::Mutex<Option<RunningCommand>>,
    outcome: Mutex<ProcessOutcome>,
}

impl TunnelExecutor {
    pub fn new(ctx: Context, client: Arc<dyn TunnelClient>, args: Vec<String>) -> Self {
        Self {
            ctx,
            client,
            config: Mutex::new(ProcessConfig::new(args)),
            status: StatusCell::new(Status::Unstarted),
            running: tokio::sync::Mutex::new(None),
            outcome: Mutex::new(ProcessOutcome::default()),
        }
    }

    /// Resolver dialing a fresh tunnel client for every executor
    pub fn resolver(dialer: Arc<dyn TunnelDialer>) -> ResolveExecutor {
        Arc::new(move |ctx: Context, args: Vec<String>| {
            let dialer = Arc::clone(&dialer);
            async move {
                let client = dialer.dial().await.map_err(|e| e.wrap("opening exec tunnel"))?;
                Ok(Arc::new(TunnelExecutor::new(ctx, client, args)) as Arc<dyn Executor>)
            }
            .boxed()
        })
    }

    fn spawn_copies(
        process: &mut dyn TunnelProcess,
        stdin: Option<InputReader>,
        stdout: OutputWriter,
        stderr: OutputWriter,
    ) -> Vec<JoinHandle<Result<u64>>> {
        let mut copies = Vec::with_capacity(3);
        if let (Some(input), Some(pipe)) = (stdin, process.take_stdin()) {
            copies.push(tokio::spawn(copy_from_reader(input, pipe)));
        }
        if let Some(pipe) = process.take_stdout() {
            copies.push(tokio::spawn(copy_to_writer(pipe, stdout)));
        }
        if let Some(pipe) = process.take_stderr() {
            copies.push(tokio::spawn(copy_to_writer(pipe, stderr)));
        }
        copies
    }
}

/// Join every copy task, collecting failures and panics alike.
async fn join_copies(copies: Vec<JoinHandle<Result<u64>>>) -> Result<()> {
    let mut errors = ErrorCollector::new();
    for joined in join_all(copies).await {
        match joined {
            Ok(result) => {
                errors.add_result(result);
            }
            Err(e) => errors.add(Error::Internal(format!("tunnel I/O task failed: {}", e))),
        }
    }
    errors.into_result()
}

#[async_trait]
impl Executor for TunnelExecutor {
    fn args(&self) -> Vec<String> {
        self.config.lock().args.clone()
    }

    fn env(&self) -> Vec<String> {
        self.config.lock().env.clone()
    }

    fn set_env(&self, env: Vec<String>) {
        self.config.lock().env = env;
    }

    fn dir(&self) -> Option<PathBuf> {
        self.config.lock().dir.clone()
    }

    fn set_dir(&self, dir: PathBuf) {
        self.config.lock().dir = Some(dir);
    }

    fn set_stdin(&self, input: InputReader) {
        self.config.lock().stdin = Some(input);
    }

    fn stdout(&self) -> OutputWriter {
        self.config.lock().stdout.clone()
    }

    fn set_stdout(&self, writer: OutputWriter) {
        self.config.lock().stdout = writer;
    }

    fn stderr(&self) -> OutputWriter {
        self.config.lock().stderr.clone()
    }

    fn set_stderr(&self, writer: OutputWriter) {
        self.config.lock().stderr = writer;
    }

    fn status(&self) -> Status {
        self.status.get()
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        let status = self.status.get();
        if status.after(Status::Unstarted) {
            return Err(Error::lifecycle(format!(
                "cannot start a tunneled process that is already {}",
                status
            )));
        }
        self.ctx.check()?;

        let (command, stdin, stdout, stderr) = {
            let mut config = self.config.lock();
            let stdin = config.stdin.take();
            let command = TunnelCommand {
                args: config.args.clone(),
                env: config.env.clone(),
                dir: config.dir.clone(),
                stdin: stdin.is_some(),
            };
            (command, stdin, config.stdout.clone(), config.stderr.clone())
        };

        let mut process = match self.client.start_command(command).await {
            Ok(process) => process,
            Err(e) => {
                let err = Error::transport("starting tunneled command", e);
                return Err(match self.client.close().await {
                    Ok(()) => err,
                    Err(cleanup) => err.with_cleanup(cleanup),
                });
            }
        };

        let pid = process.pid();
        let copies = Self::spawn_copies(process.as_mut(), stdin, stdout, stderr);
        self.outcome.lock().pid = pid;
        *running = Some(RunningCommand { process, copies });
        self.status.set(Status::Running);

        info!("Started tunneled command (remote pid {})", pid);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        if self.status.get().before(Status::Running) {
            return Err(Error::lifecycle(
                "cannot wait on a tunneled process that has not been started",
            ));
        }

        let mut running = self.running.lock().await;
        if self.status.get().after(Status::Running) {
            return self.outcome.lock().cached_result();
        }
        let Some(command) = running.as_mut() else {
            return self.outcome.lock().cached_result();
        };

        let event = tokio::select! {
            exit = command.process.wait() => WaitEvent::Exited(exit),
            reason = self.ctx.done() => WaitEvent::Done(reason),
        };

        let exit = match event {
            WaitEvent::Done(reason) => return Err(reason),
            WaitEvent::Exited(exit) => {
                exit.map_err(|e| Error::transport("waiting on tunneled command", e))?
            }
        };

        let copies = std::mem::take(&mut command.copies);
        let io_result = join_copies(copies).await;
        *running = None;

        let result = {
            let mut outcome = self.outcome.lock();
            let result = match exit {
                Some(code) => outcome.record_exit(code).and_then(|_| io_result),
                None => Err(Error::transport(
                    "waiting on tunneled command",
                    "remote side reported no exit code",
                )),
            };
            outcome.result = Some(result.clone());
            result
        };
        self.status.set(Status::Exited);
        info!("Tunneled command exited with code {}", self.exit_code());

        result
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        let status = self.status.get();
        if status != Status::Running {
            return Err(Error::lifecycle(format!(
                "cannot signal a tunneled process that is {}",
                status
            )));
        }

        let pid = self.outcome.lock().pid;
        if pid <= 0 {
            return Err(Error::lifecycle("tunneled process has no pid to signal"));
        }

        let op = format!("sending {} to tunneled process {}", sig, pid);
        let kill = TunnelCommand {
            args: vec![
                "kill".to_string(),
                format!("-{}", sig.short_name()),
                pid.to_string(),
            ],
            ..Default::default()
        };

        let mut process = self
            .client
            .start_command(kill)
            .await
            .map_err(|e| Error::transport(op.clone(), e))?;
        match process.wait().await {
            Ok(Some(0)) => {}
            Ok(Some(code)) => {
                return Err(Error::transport(op, format!("kill exited with code {}", code)))
            }
            Ok(None) => return Err(Error::transport(op, "kill reported no exit code")),
            Err(e) => return Err(Error::transport(op, e)),
        }

        self.outcome.lock().signal = Some(sig);
        debug!("Sent {} to tunneled process {}", sig, pid);
        Ok(())
    }

    async fn pid(&self) -> i32 {
        self.outcome.lock().pid
    }

    fn exit_code(&self) -> i32 {
        self.outcome.lock().exit_code
    }

    fn success(&self) -> bool {
        if self.status.get().before(Status::Exited) {
            return false;
        }
        matches!(self.outcome.lock().result, Some(Ok(())))
    }

    fn signal_info(&self) -> Option<Signal> {
        self.outcome.lock().signal
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(command) = running.take() {
                for copy in command.copies {
                    copy.abort();
                }
            }
        }

        let result = self.client.close().await;
        if let Err(e) = &result {
            warn!("failed to close tunnel client: {}", e);
        }
        self.status.set(Status::Closed);
        result
    }
}
