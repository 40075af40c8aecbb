//! SSH executor - runs a process through a remote shell session
//!
//! The SSH transport itself is supplied by the caller through the
//! [`SshDialer`], [`SshClient`] and [`SshSession`] traits. The executor turns
//! its environment, working directory and arguments into a small shell script
//! and drives the session through the common lifecycle. Remote processes have
//! no visible PID, so [`Executor::pid`] is always -1.

use crate::executor::{Executor, ProcessConfig, ProcessOutcome, ResolveExecutor};
use crate::io::{InputReader, OutputWriter};
use crate::options::Remote;
use crate::signal::Signal;
use crate::status::{Status, StatusCell};
use async_trait::async_trait;
use futures::FutureExt;
use overseer_foundation::{Context, Error, ErrorCollector, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a remote command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshExit {
    /// Exit status reported by the server
    pub code: i32,
    /// Signal name (without `SIG`) when the command was killed by a signal
    pub signal: Option<String>,
}

impl SshExit {
    pub fn code(code: i32) -> Self {
        Self { code, signal: None }
    }

    pub fn signaled(name: impl Into<String>) -> Self {
        Self {
            code: -1,
            signal: Some(name.into()),
        }
    }
}

/// Standard streams attached to a session
pub struct SshStdio {
    pub stdin: Option<InputReader>,
    pub stdout: OutputWriter,
    pub stderr: OutputWriter,
}

/// One command channel on an established connection
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Run `command` through the remote shell with the given streams
    async fn start(&self, command: &str, stdio: SshStdio) -> Result<()>;

    /// Block until the remote command ends
    async fn wait(&self) -> Result<SshExit>;

    /// Send a signal request; `name` has no `SIG` prefix
    async fn signal(&self, name: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// The connection that owns a session
#[async_trait]
pub trait SshClient: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// A client and a fresh session on it
pub struct SshConnection {
    pub client: Arc<dyn SshClient>,
    pub session: Arc<dyn SshSession>,
}

/// Opens connections described by [`Remote`] options
#[async_trait]
pub trait SshDialer: Send + Sync {
    async fn dial(&self, remote: &Remote) -> Result<SshConnection>;
}

/// Build the script run by the remote shell.
pub fn remote_script(
    args: &[String],
    env: &[String],
    dir: Option<&std::path::Path>,
) -> Result<String> {
    let mut lines = Vec::with_capacity(env.len() + 2);

    for entry in env {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::invalid(format!("malformed environment entry '{}'", entry)))?;
        let value = shlex::try_quote(value)
            .map_err(|e| Error::invalid(format!("cannot quote value of {}: {}", key, e)))?;
        lines.push(format!("export {}={}", key, value));
    }

    if let Some(dir) = dir {
        let dir = dir.to_string_lossy();
        let dir = shlex::try_quote(&dir)
            .map_err(|e| Error::invalid(format!("cannot quote working directory: {}", e)))?;
        lines.push(format!("cd {}", dir));
    }

    let command = shlex::try_join(args.iter().map(String::as_str))
        .map_err(|e| Error::invalid(format!("cannot quote command: {}", e)))?;
    lines.push(command);

    Ok(lines.join("\n"))
}

enum WaitEvent {
    Exited(Result<SshExit>),
    Done(Error),
}

/// Executor backed by an SSH session
pub struct SshExecutor {
    ctx: Context,
    client: Arc<dyn SshClient>,
    session: Arc<dyn SshSession>,
    config: Mutex<ProcessConfig>,
    status: StatusCell,
    operation: tokio::sync::Mutex<()>,
    outcome: Mutex<ProcessOutcome>,
}

impl SshExecutor {
    pub fn new(ctx: Context, connection: SshConnection, args: Vec<String>) -> Self {
        Self {
            ctx,
            client: connection.client,
            session: connection.session,
            config: Mutex::new(ProcessConfig::new(args)),
            status: StatusCell::new(Status::Unstarted),
            operation: tokio::sync::Mutex::new(()),
            outcome: Mutex::new(ProcessOutcome::default()),
        }
    }

    /// Resolver that dials `remote` for every executor it creates
    pub fn resolver(remote: Remote, dialer: Arc<dyn SshDialer>) -> ResolveExecutor {
        Arc::new(move |ctx: Context, args: Vec<String>| {
            let remote = remote.clone();
            let dialer = Arc::clone(&dialer);
            async move {
                let connection = dialer
                    .dial(&remote)
                    .await
                    .map_err(|e| e.wrap(format!("connecting to {}", remote.destination())))?;
                Ok(Arc::new(SshExecutor::new(ctx, connection, args)) as Arc<dyn Executor>)
            }
            .boxed()
        })
    }

    async fn teardown(&self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        errors.add_result(self.session.close().await);
        errors.add_result(self.client.close().await);
        errors.into_result()
    }
}

#[async_trait]
impl Executor for SshExecutor {
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
        let _operation = self.operation.lock().await;

        let status = self.status.get();
        if status.after(Status::Unstarted) {
            return Err(Error::lifecycle(format!(
                "cannot start a remote process that is already {}",
                status
            )));
        }
        self.ctx.check()?;

        let (script, stdio) = {
            let mut config = self.config.lock();
            let script = remote_script(&config.args, &config.env, config.dir.as_deref())?;
            let stdio = SshStdio {
                stdin: config.stdin.take(),
                stdout: config.stdout.clone(),
                stderr: config.stderr.clone(),
            };
            (script, stdio)
        };

        if let Err(e) = self.session.start(&script, stdio).await {
            let err = Error::transport("starting remote command", e);
            return Err(match self.teardown().await {
                Ok(()) => err,
                Err(cleanup) => err.with_cleanup(cleanup),
            });
        }

        self.status.set(Status::Running);
        info!("Started remote command: {}", self.args().join(" "));
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        if self.status.get().before(Status::Running) {
            return Err(Error::lifecycle(
                "cannot wait on a remote process that has not been started",
            ));
        }

        let _operation = self.operation.lock().await;
        if self.status.get().after(Status::Running) {
            return self.outcome.lock().cached_result();
        }

        let event = tokio::select! {
            exit = self.session.wait() => WaitEvent::Exited(exit),
            reason = self.ctx.done() => WaitEvent::Done(reason),
        };

        let exit = match event {
            WaitEvent::Done(reason) => return Err(reason),
            WaitEvent::Exited(exit) => {
                exit.map_err(|e| Error::transport("waiting on remote command", e))?
            }
        };

        let result = {
            let mut outcome = self.outcome.lock();
            match exit.signal.as_deref() {
                Some(name) => {
                    let sig = name.parse::<Signal>().ok();
                    let number = sig.map(Signal::number).unwrap_or(exit.code);
                    outcome.signal = sig.or(outcome.signal);
                    outcome.exit_code = number;
                    let result = Err(Error::Signaled { signal: number });
                    outcome.result = Some(result.clone());
                    result
                }
                None => outcome.record_exit(exit.code),
            }
        };
        self.status.set(Status::Exited);
        info!("Remote command exited with code {}", self.exit_code());

        result
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        let status = self.status.get();
        if status != Status::Running {
            return Err(Error::lifecycle(format!(
                "cannot signal a remote process that is {}",
                status
            )));
        }

        self.session
            .signal(sig.short_name())
            .await
            .map_err(|e| Error::transport(format!("sending {} over ssh", sig), e))?;

        self.outcome.lock().signal = Some(sig);
        debug!("Sent {} to remote command", sig);
        Ok(())
    }

    async fn pid(&self) -> i32 {
        -1
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
        let result = self.teardown().await;
        if let Err(e) = &result {
            warn!("failed to close ssh session: {}", e);
        }
        self.status.set(Status::Closed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;
    use std::io::Write;
    use tokio::sync::Notify;

    /// Session that records what it was asked to do
    #[derive(Default)]
    struct FakeSession {
        script: Mutex<Option<String>>,
        signals: Mutex<Vec<String>>,
        exit: Mutex<Option<SshExit>>,
        fail_start: bool,
        finished: Notify,
        closed: Mutex<u32>,
    }

    impl FakeSession {
        fn finish(&self, exit: SshExit) {
            *self.exit.lock() = Some(exit);
            self.finished.notify_one();
        }
    }

    #[async_trait]
    impl SshSession for FakeSession {
        async fn start(&self, command: &str, mut stdio: SshStdio) -> Result<()> {
            if self.fail_start {
                return Err(Error::transport("exec request", "channel refused"));
            }
            *self.script.lock() = Some(command.to_string());
            stdio.stdout.write_all(b"remote output\n")?;
            Ok(())
        }

        async fn wait(&self) -> Result<SshExit> {
            loop {
                let exit = self.exit.lock().clone();
                if let Some(exit) = exit {
                    return Ok(exit);
                }
                self.finished.notified().await;
            }
        }

        async fn signal(&self, name: &str) -> Result<()> {
            self.signals.lock().push(name.to_string());
            self.finish(SshExit::signaled(name));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            *self.closed.lock() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeClient {
        closed: Mutex<u32>,
    }

    #[async_trait]
    impl SshClient for FakeClient {
        async fn close(&self) -> Result<()> {
            *self.closed.lock() += 1;
            Ok(())
        }
    }

    fn executor(session: Arc<FakeSession>, client: Arc<FakeClient>, args: &[&str]) -> SshExecutor {
        SshExecutor::new(
            Context::background(),
            SshConnection { client, session },
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_remote_script() {
        let script = remote_script(
            &["echo".to_string(), "hello world".to_string()],
            &["FOO=bar baz".to_string(), "EMPTY=".to_string()],
            Some(std::path::Path::new("/srv/app")),
        )
        .unwrap();
        assert_eq!(
            script,
            "export FOO='bar baz'\nexport EMPTY=''\ncd /srv/app\necho 'hello world'"
        );
    }

    #[test]
    fn test_remote_script_rejects_malformed_env() {
        assert!(remote_script(&["true".to_string()], &["NOEQUALS".to_string()], None).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_success() {
        let session = Arc::new(FakeSession::default());
        let client = Arc::new(FakeClient::default());
        let exec = executor(session.clone(), client.clone(), &["ls"]);
        let out = SharedBuffer::new();
        exec.set_stdout(out.writer());

        assert!(matches!(exec.wait().await, Err(Error::Lifecycle(_))));
        exec.start().await.unwrap();
        assert_eq!(session.script.lock().as_deref(), Some("ls"));
        assert!(exec.start().await.is_err());
        assert_eq!(exec.pid().await, -1);

        session.finish(SshExit::code(0));
        exec.wait().await.unwrap();
        assert!(exec.success());
        assert_eq!(exec.exit_code(), 0);
        assert_eq!(out.contents(), "remote output\n");

        exec.close().await.unwrap();
        assert_eq!(exec.status(), Status::Closed);
        assert_eq!(*session.closed.lock(), 1);
        assert_eq!(*client.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let session = Arc::new(FakeSession::default());
        let exec = executor(session.clone(), Arc::new(FakeClient::default()), &["false"]);
        exec.start().await.unwrap();
        session.finish(SshExit::code(2));
        assert!(matches!(exec.wait().await, Err(Error::Exit { code: 2 })));
        assert_eq!(exec.exit_code(), 2);
        assert!(!exec.success());
    }

    #[tokio::test]
    async fn test_signal_uses_short_name() {
        let session = Arc::new(FakeSession::default());
        let exec = executor(session.clone(), Arc::new(FakeClient::default()), &["sleep", "100"]);
        assert!(exec.signal(Signal::Term).await.is_err());
        exec.start().await.unwrap();
        exec.signal(Signal::Term).await.unwrap();
        assert_eq!(*session.signals.lock(), vec!["TERM".to_string()]);

        assert!(matches!(exec.wait().await, Err(Error::Signaled { .. })));
        assert_eq!(exec.signal_info(), Some(Signal::Term));
        assert_eq!(exec.exit_code(), Signal::Term.number());
        assert!(exec.signal(Signal::Kill).await.is_err());
    }

    #[tokio::test]
    async fn test_start_failure_tears_down() {
        let session = Arc::new(FakeSession {
            fail_start: true,
            ..Default::default()
        });
        let client = Arc::new(FakeClient::default());
        let exec = executor(session.clone(), client.clone(), &["true"]);
        assert!(matches!(exec.start().await, Err(Error::Transport { .. })));
        assert_eq!(exec.status(), Status::Unstarted);
        assert_eq!(*session.closed.lock(), 1);
        assert_eq!(*client.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_on_cancel() {
        let ctx = Context::background();
        let session = Arc::new(FakeSession::default());
        let exec = SshExecutor::new(
            ctx.clone(),
            SshConnection {
                client: Arc::new(FakeClient::default()),
                session: session.clone(),
            },
            vec!["sleep".into(), "100".into()],
        );
        exec.start().await.unwrap();
        ctx.cancel();
        assert!(matches!(exec.wait().await, Err(Error::Cancelled)));
        assert_eq!(exec.status(), Status::Running);
    }
}
