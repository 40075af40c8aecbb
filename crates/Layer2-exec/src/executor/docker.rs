//! Docker executor - runs a process as a Docker container
//!
//! The container is created stopped, optionally attached to for standard
//! I/O, and then started. A container that fails to come up is force-removed
//! before the error is returned.

use crate::executor::{Executor, ProcessConfig, ProcessOutcome};
use crate::io::{copy_from_reader, InputReader, OutputWriter};
use crate::signal::Signal;
use crate::status::{Status, StatusCell};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use overseer_foundation::{Context, Error, ErrorCollector, Result};
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signals the Docker daemon accepts for Windows containers
const WINDOWS_SIGNALS: &[Signal] = &[Signal::Kill, Signal::Term];

/// Translate a signal into the name the daemon expects for `platform`
pub fn docker_signal_name(sig: Signal, platform: &str) -> Result<&'static str> {
    match platform {
        "windows" if !WINDOWS_SIGNALS.contains(&sig) => Err(Error::invalid(format!(
            "signal {} is not supported for windows containers",
            sig
        ))),
        _ => Ok(sig.name()),
    }
}

enum WaitEvent {
    Exited(Result<i32>),
    Done(Error),
}

/// Executor backed by a Docker container
pub struct DockerExecutor {
    ctx: Context,
    client: Docker,
    image: String,
    platform: String,
    config: Mutex<ProcessConfig>,
    status: StatusCell,
    container_id: RwLock<Option<String>>,
    operation: tokio::sync::Mutex<Vec<JoinHandle<Result<u64>>>>,
    outcome: Mutex<ProcessOutcome>,
}

impl DockerExecutor {
    pub fn new(
        ctx: Context,
        client: Docker,
        platform: impl Into<String>,
        image: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            client,
            image: image.into(),
            platform: platform.into(),
            config: Mutex::new(ProcessConfig::new(args)),
            status: StatusCell::new(Status::Unstarted),
            container_id: RwLock::new(None),
            operation: tokio::sync::Mutex::new(Vec::new()),
            outcome: Mutex::new(ProcessOutcome::default()),
        }
    }

    /// ID of the container once it has been created
    pub fn container_id(&self) -> Option<String> {
        self.container_id.read().clone()
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn container_config(&self, config: &ProcessConfig) -> Config<String> {
        Config {
            image: Some(self.image.clone()),
            cmd: Some(config.args.clone()),
            env: Some(config.env.clone()),
            working_dir: config.dir.as_ref().map(|d| d.to_string_lossy().into_owned()),
            attach_stdin: Some(config.stdin.is_some()),
            attach_stdout: Some(!config.stdout.is_discard()),
            attach_stderr: Some(!config.stderr.is_discard()),
            open_stdin: Some(config.stdin.is_some()),
            stdin_once: Some(config.stdin.is_some()),
            tty: Some(false),
            ..Default::default()
        }
    }

    async fn create(&self, config: Config<String>) -> Result<String> {
        let options = if self.platform.is_empty() {
            None
        } else {
            Some(CreateContainerOptions {
                name: String::new(),
                platform: Some(self.platform.clone()),
            })
        };

        let response = self
            .client
            .create_container(options, config)
            .await
            .map_err(|e| Error::transport("creating container", e))?;

        for warning in &response.warnings {
            warn!("docker create warning for {}: {}", response.id, warning);
        }
        Ok(response.id)
    }

    async fn attach(
        &self,
        id: &str,
        stdin: Option<InputReader>,
        stdout: OutputWriter,
        stderr: OutputWriter,
    ) -> Result<Vec<JoinHandle<Result<u64>>>> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(stdin.is_some()),
            stdout: Some(!stdout.is_discard()),
            stderr: Some(!stderr.is_discard()),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .client
            .attach_container(id, Some(options))
            .await
            .map_err(|e| Error::transport(format!("attaching to container {}", id), e))?;

        let mut tasks = Vec::with_capacity(2);
        if let Some(reader) = stdin {
            tasks.push(tokio::spawn(copy_from_reader(reader, input)));
        }
        tasks.push(tokio::spawn(demultiplex(output, stdout, stderr)));
        Ok(tasks)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Error::transport(format!("removing container {}", id), e))
    }

    /// Remove a container that failed to launch, folding any removal
    /// failure into the launch error.
    async fn abandon(&self, id: &str, launch: Error) -> Error {
        let err = match self.remove(id).await {
            Ok(()) => launch,
            Err(cleanup) => launch.with_cleanup(cleanup),
        };
        *self.container_id.write() = None;
        err
    }

    /// Bring the container up; on failure the caller removes it.
    async fn launch(&self, id: &str) -> Result<Vec<JoinHandle<Result<u64>>>> {
        let (stdin, stdout, stderr, has_io) = {
            let mut config = self.config.lock();
            let has_io = config.has_io();
            (
                config.stdin.take(),
                config.stdout.clone(),
                config.stderr.clone(),
                has_io,
            )
        };

        let tasks = if has_io {
            self.attach(id, stdin, stdout, stderr).await?
        } else {
            Vec::new()
        };

        if let Err(e) = self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            for task in &tasks {
                task.abort();
            }
            return Err(Error::transport(format!("starting container {}", id), e));
        }

        Ok(tasks)
    }

    async fn wait_for_exit(&self, id: &str) -> Result<i32> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.client.wait_container(id, Some(options)));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code as i32),
            // the daemon reports non-zero exits as errors
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(code as i32)
            }
            Some(Err(e)) => Err(Error::transport(format!("waiting on container {}", id), e)),
            None => self.inspect_exit_code(id).await,
        }
    }

    async fn inspect_exit_code(&self, id: &str) -> Result<i32> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::transport(format!("inspecting container {}", id), e))?;

        info.state
            .and_then(|state| state.exit_code)
            .map(|code| code as i32)
            .ok_or_else(|| Error::transport(format!("inspecting container {}", id), "no exit code"))
    }

    fn require_container(&self) -> Result<String> {
        self.container_id()
            .ok_or_else(|| Error::lifecycle("container has not been created"))
    }
}

/// Split the attached stream into the stdout and stderr sinks.
async fn demultiplex<S>(
    mut output: S,
    mut stdout: OutputWriter,
    mut stderr: OutputWriter,
) -> Result<u64>
where
    S: futures::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut total = 0u64;
    while let Some(frame) = output.next().await {
        let frame = frame.map_err(|e| Error::transport("reading container output", e))?;
        match frame {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                stdout.write_all(&message)?;
                total += message.len() as u64;
            }
            LogOutput::StdErr { message } => {
                stderr.write_all(&message)?;
                total += message.len() as u64;
            }
            LogOutput::StdIn { .. } => {}
        }
    }
    stdout.flush()?;
    stderr.flush()?;
    Ok(total)
}

#[async_trait]
impl Executor for DockerExecutor {
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
        let mut io_tasks = self.operation.lock().await;

        let status = self.status.get();
        if status.after(Status::Unstarted) {
            return Err(Error::lifecycle(format!(
                "cannot start a container that is already {}",
                status
            )));
        }
        self.ctx.check()?;

        let config = {
            let config = self.config.lock();
            self.container_config(&config)
        };
        let id = self.create(config).await?;
        *self.container_id.write() = Some(id.clone());
        debug!("Created container {} from image {}", id, self.image);

        match self.launch(&id).await {
            Ok(tasks) => {
                *io_tasks = tasks;
            }
            Err(e) => return Err(self.abandon(&id, e).await),
        }

        self.status.set(Status::Running);
        info!("Started container {} ({})", id, self.image);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        if self.status.get().before(Status::Running) {
            return Err(Error::lifecycle(
                "cannot wait on a container that has not been started",
            ));
        }

        let mut io_tasks = self.operation.lock().await;
        if self.status.get().after(Status::Running) {
            return self.outcome.lock().cached_result();
        }
        let id = self.require_container()?;

        // Cancellation does not stop the container; callers signal or close it.
        let event = tokio::select! {
            exit = self.wait_for_exit(&id) => WaitEvent::Exited(exit),
            reason = self.ctx.done() => WaitEvent::Done(reason),
        };

        let code = match event {
            WaitEvent::Done(reason) => {
                debug!("context ended while waiting on container {}: {}", id, reason);
                return Err(reason);
            }
            WaitEvent::Exited(exit) => exit?,
        };

        let mut io_errors = ErrorCollector::new();
        for task in io_tasks.drain(..) {
            match task.await {
                Ok(result) => {
                    io_errors.add_result(result);
                }
                Err(e) => {
                    io_errors.add(Error::Internal(format!("container I/O task failed: {}", e)))
                }
            }
        }

        let result = {
            let mut outcome = self.outcome.lock();
            let result = outcome.record_exit(code).and_then(|_| io_errors.into_result());
            outcome.result = Some(result.clone());
            result
        };
        self.status.set(Status::Exited);
        info!("Container {} exited with code {}", id, code);

        result
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        let status = self.status.get();
        if status != Status::Running {
            return Err(Error::lifecycle(format!(
                "cannot signal a container that is {}",
                status
            )));
        }
        let id = self.require_container()?;
        let name = docker_signal_name(sig, &self.platform)?;

        self.client
            .kill_container(&id, Some(KillContainerOptions { signal: name }))
            .await
            .map_err(|e| Error::transport(format!("sending {} to container {}", name, id), e))?;

        self.outcome.lock().signal = Some(sig);
        debug!("Sent {} to container {}", name, id);
        Ok(())
    }

    async fn pid(&self) -> i32 {
        let cached = self.outcome.lock().pid;
        if cached > 0 || !self.status.get().between_inclusive(Status::Running, Status::Exited) {
            return cached;
        }
        let Some(id) = self.container_id() else {
            return -1;
        };

        match self
            .client
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let pid = info
                    .state
                    .and_then(|state| state.pid)
                    .map(|p| p as i32)
                    .filter(|p| *p > 0)
                    .unwrap_or(-1);
                if pid > 0 {
                    self.outcome.lock().pid = pid;
                }
                pid
            }
            Err(e) => {
                warn!("failed to inspect container {} for pid: {}", id, e);
                -1
            }
        }
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
        let mut errors = ErrorCollector::new();

        let taken = self.container_id.write().take();
        if let Some(id) = taken {
            if let Err(e) = self.remove(&id).await {
                warn!("failed to remove container {}: {}", id, e);
                errors.add(e);
            }
        }

        // the attach stream ends with the container; anything left is stuck
        if let Ok(mut io_tasks) = self.operation.try_lock() {
            for task in io_tasks.drain(..) {
                task.abort();
            }
        }

        self.status.set(Status::Closed);
        errors.into_result()
    }
}
