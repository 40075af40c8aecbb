//! Local executor - runs processes directly on the host
//!
//! Features:
//! - Output copied into the configured writers by background tasks
//! - Standard input fed from a reader
//! - Context deadline enforcement (the child is killed when the context ends)
//! - OS signal delivery by PID

use crate::executor::{Executor, ProcessOutcome, ResolveExecutor};
use crate::io::{copy_from_reader, copy_to_writer, InputReader, OutputWriter};
use crate::signal::Signal;
use crate::status::{Status, StatusCell};
use async_trait::async_trait;
use futures::FutureExt;
use overseer_foundation::{Context, Error, ErrorCollector, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings applied when the process is spawned
#[derive(Default)]
struct LocalConfig {
    args: Vec<String>,
    env: Option<Vec<String>>,
    dir: Option<PathBuf>,
    stdin: Option<InputReader>,
    stdout: OutputWriter,
    stderr: OutputWriter,
}

struct RunningChild {
    child: Child,
    copies: Vec<JoinHandle<Result<u64>>>,
}

enum WaitEvent {
    Exited(std::io::Result<ExitStatus>),
    Done(Error),
}

/// Executor backed by a native OS process
pub struct LocalExecutor {
    ctx: Context,
    config: Mutex<LocalConfig>,
    status: StatusCell,
    process: tokio::sync::Mutex<Option<RunningChild>>,
    outcome: Mutex<ProcessOutcome>,
}

impl LocalExecutor {
    /// Create an unstarted executor bound to `ctx`
    pub fn new(ctx: Context, args: Vec<String>) -> Self {
        Self {
            ctx,
            config: Mutex::new(LocalConfig {
                args,
                ..Default::default()
            }),
            status: StatusCell::new(Status::Unstarted),
            process: tokio::sync::Mutex::new(None),
            outcome: Mutex::new(ProcessOutcome::default()),
        }
    }

    /// Resolver producing local executors
    pub fn resolver() -> ResolveExecutor {
        Arc::new(|ctx: Context, args: Vec<String>| {
            async move {
                if args.is_empty() {
                    return Err(Error::invalid("cannot create a process with no arguments"));
                }
                Ok(Arc::new(LocalExecutor::new(ctx, args)) as Arc<dyn Executor>)
            }
            .boxed()
        })
    }

    fn build_command(config: &mut LocalConfig) -> Result<(Command, Option<InputReader>)> {
        let (program, rest) = config
            .args
            .split_first()
            .ok_or_else(|| Error::invalid("cannot start a process with no arguments"))?;

        let mut cmd = Command::new(program);
        cmd.args(rest);

        if let Some(dir) = &config.dir {
            cmd.current_dir(dir);
        }

        if let Some(env) = &config.env {
            cmd.env_clear();
            for entry in env {
                match entry.split_once('=') {
                    Some((key, value)) => {
                        cmd.env(key, value);
                    }
                    None => warn!("ignoring malformed environment entry '{}'", entry),
                }
            }
        }

        let stdin = config.stdin.take();
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if config.stdout.is_discard() {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.stderr(if config.stderr.is_discard() {
            Stdio::null()
        } else {
            Stdio::piped()
        });

        Ok((cmd, stdin))
    }

    fn record_exit(&self, status: &ExitStatus) -> Result<()> {
        let mut outcome = self.outcome.lock();

        if let Some(code) = status.code() {
            outcome.exit_code = code;
            return if code == 0 {
                Ok(())
            } else {
                Err(Error::Exit { code })
            };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(number) = status.signal() {
                outcome.exit_code = number;
                outcome.signal = Signal::from_number(number);
                return Err(Error::Signaled { signal: number });
            }
        }

        Err(Error::Internal(format!(
            "process exited with unrecognized status: {}",
            status
        )))
    }

    fn cached_result(&self) -> Result<()> {
        self.outcome.lock().cached_result()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn args(&self) -> Vec<String> {
        self.config.lock().args.clone()
    }

    fn env(&self) -> Vec<String> {
        self.config.lock().env.clone().unwrap_or_default()
    }

    fn set_env(&self, env: Vec<String>) {
        self.config.lock().env = Some(env);
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
        let mut process = self.process.lock().await;

        let status = self.status.get();
        if status.after(Status::Unstarted) {
            return Err(Error::lifecycle(format!(
                "cannot start a process that is already {}",
                status
            )));
        }
        self.ctx.check()?;

        let (mut cmd, stdin, stdout, stderr, program) = {
            let mut config = self.config.lock();
            let (cmd, stdin) = Self::build_command(&mut config)?;
            (
                cmd,
                stdin,
                config.stdout.clone(),
                config.stderr.clone(),
                config.args[0].clone(),
            )
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::from(e).wrap(format!("starting process '{}'", program)))?;

        let mut copies = Vec::with_capacity(3);
        if let (Some(input), Some(pipe)) = (stdin, child.stdin.take()) {
            copies.push(tokio::spawn(copy_from_reader(input, pipe)));
        }
        if let Some(pipe) = child.stdout.take() {
            copies.push(tokio::spawn(copy_to_writer(pipe, stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            copies.push(tokio::spawn(copy_to_writer(pipe, stderr)));
        }

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        self.outcome.lock().pid = pid;
        *process = Some(RunningChild { child, copies });
        self.status.set(Status::Running);

        info!("Started local process '{}' (pid {})", program, pid);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        if self.status.get().before(Status::Running) {
            return Err(Error::lifecycle(
                "cannot wait on a process that has not been started",
            ));
        }

        let mut process = self.process.lock().await;
        if self.status.get().after(Status::Running) {
            return self.cached_result();
        }
        let Some(running) = process.as_mut() else {
            return self.cached_result();
        };

        let event = tokio::select! {
            exit = running.child.wait() => WaitEvent::Exited(exit),
            reason = self.ctx.done() => WaitEvent::Done(reason),
        };

        let (exit, ctx_err) = match event {
            WaitEvent::Exited(exit) => (exit, None),
            WaitEvent::Done(reason) => {
                debug!("context ended before process exit, killing: {}", reason);
                if let Err(e) = running.child.start_kill() {
                    warn!("failed to kill process after context ended: {}", e);
                }
                (running.child.wait().await, Some(reason))
            }
        };

        let mut copy_errors = ErrorCollector::new();
        for handle in running.copies.drain(..) {
            match handle.await {
                Ok(result) => {
                    copy_errors.add_result(result);
                }
                Err(e) => {
                    copy_errors.add(Error::Internal(format!("output copy task failed: {}", e)))
                }
            }
        }
        *process = None;

        let result = match (exit, ctx_err) {
            (Ok(status), Some(reason)) => {
                let _ = self.record_exit(&status);
                Err(reason)
            }
            (Err(e), Some(reason)) => Err(reason.with_cleanup(Error::from(e))),
            (Err(e), None) => Err(Error::from(e).wrap("waiting for process")),
            (Ok(status), None) => self
                .record_exit(&status)
                .and_then(|_| copy_errors.into_result()),
        };

        {
            let mut outcome = self.outcome.lock();
            outcome.result = Some(result.clone());
            info!(
                "Local process {} exited with code {}",
                outcome.pid, outcome.exit_code
            );
        }
        self.status.set(Status::Exited);

        result
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        let status = self.status.get();
        if status != Status::Running {
            return Err(Error::lifecycle(format!(
                "cannot signal a process that is {}",
                status
            )));
        }

        let pid = self.outcome.lock().pid;
        deliver_signal(pid, sig)?;
        self.outcome.lock().signal = Some(sig);
        debug!("Sent {} to local process {}", sig, pid);
        Ok(())
    }

    async fn pid(&self) -> i32 {
        if self.status.get().before(Status::Running) {
            return -1;
        }
        self.outcome.lock().pid
    }

    fn exit_code(&self) -> i32 {
        if self.status.get().before(Status::Exited) {
            return -1;
        }
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
        if self.status.get() == Status::Running {
            let pid = self.outcome.lock().pid;
            if let Err(e) = deliver_signal(pid, Signal::Kill) {
                warn!("failed to kill local process {} on close: {}", pid, e);
            }
        }
        self.status.set(Status::Closed);
        Ok(())
    }
}

#[cfg(unix)]
fn deliver_signal(pid: i32, sig: Signal) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return Err(Error::lifecycle("process has no pid to signal"));
    }
    kill(Pid::from_raw(pid), sig.to_nix())
        .map_err(|e| Error::transport(format!("sending {} to process {}", sig, pid), e))
}

#[cfg(not(unix))]
fn deliver_signal(pid: i32, sig: Signal) -> Result<()> {
    Err(Error::transport(
        format!("sending {} to process {}", sig, pid),
        "signal delivery is only supported on unix",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;
    use std::time::{Duration, Instant};

    fn local(args: &[&str]) -> LocalExecutor {
        LocalExecutor::new(
            Context::background(),
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_true_succeeds() {
        let exec = local(&["true"]);
        assert_eq!(exec.status(), Status::Unstarted);
        exec.start().await.unwrap();
        assert!(exec.pid().await > 0);
        exec.wait().await.unwrap();
        assert_eq!(exec.exit_code(), 0);
        assert!(exec.success());
        assert_eq!(exec.status(), Status::Exited);
    }

    #[tokio::test]
    async fn test_false_reports_exit_code() {
        let exec = local(&["false"]);
        exec.start().await.unwrap();
        let err = exec.wait().await.unwrap_err();
        assert!(matches!(err, Error::Exit { code: 1 }));
        assert_eq!(exec.exit_code(), 1);
        assert!(!exec.success());

        // cached on the second call
        assert!(matches!(exec.wait().await, Err(Error::Exit { code: 1 })));
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let exec = local(&["true"]);
        assert!(matches!(exec.wait().await, Err(Error::Lifecycle(_))));
        assert_eq!(exec.exit_code(), -1);
        assert_eq!(exec.pid().await, -1);
        assert!(!exec.success());
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let exec = local(&["sleep", "5"]);
        exec.start().await.unwrap();
        assert!(matches!(exec.start().await, Err(Error::Lifecycle(_))));
        assert_eq!(exec.status(), Status::Running);
        exec.signal(Signal::Kill).await.unwrap();
        let _ = exec.wait().await;
    }

    #[tokio::test]
    async fn test_signal_death() {
        let exec = local(&["sleep", "100"]);
        exec.start().await.unwrap();
        exec.signal(Signal::Term).await.unwrap();
        let err = exec.wait().await.unwrap_err();
        assert!(matches!(err, Error::Signaled { .. }));
        assert_eq!(exec.exit_code(), Signal::Term.number());
        assert_eq!(exec.signal_info(), Some(Signal::Term));
    }

    #[tokio::test]
    async fn test_signal_requires_running() {
        let exec = local(&["true"]);
        assert!(exec.signal(Signal::Term).await.is_err());
        exec.start().await.unwrap();
        exec.wait().await.unwrap();
        assert!(matches!(exec.signal(Signal::Term).await, Err(Error::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_output_and_stdin() {
        let exec = local(&["cat"]);
        let out = SharedBuffer::new();
        exec.set_stdout(out.writer());
        exec.set_stdin(Box::new(std::io::Cursor::new(b"piped input".to_vec())));
        exec.start().await.unwrap();
        exec.wait().await.unwrap();
        assert_eq!(out.contents(), "piped input");
    }

    #[tokio::test]
    async fn test_env_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local(&["sh", "-c", "echo $FOO; pwd"]);
        let out = SharedBuffer::new();
        exec.set_stdout(out.writer());
        exec.set_env(vec![
            "FOO=bar".to_string(),
            format!("PATH={}", std::env::var("PATH").unwrap_or_default()),
        ]);
        exec.set_dir(dir.path().to_path_buf());
        exec.start().await.unwrap();
        exec.wait().await.unwrap();

        let contents = out.contents();
        assert!(contents.starts_with("bar\n"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(contents.contains(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_context_deadline_kills_child() {
        let ctx = Context::background().with_timeout(Duration::from_millis(300));
        let exec = LocalExecutor::new(ctx, vec!["sleep".into(), "10".into()]);
        let started = Instant::now();
        exec.start().await.unwrap();
        let err = exec.wait().await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_with_cancelled_context() {
        let ctx = Context::background();
        ctx.cancel();
        let exec = LocalExecutor::new(ctx, vec!["true".into()]);
        assert!(matches!(exec.start().await, Err(Error::Cancelled)));
        assert_eq!(exec.status(), Status::Unstarted);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start() {
        let exec = local(&["/definitely/not/a/binary"]);
        assert!(exec.start().await.is_err());
        assert_eq!(exec.status(), Status::Unstarted);
        exec.close().await.unwrap();
        assert_eq!(exec.status(), Status::Closed);
    }
}
