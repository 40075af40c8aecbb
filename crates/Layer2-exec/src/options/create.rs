//! Declarative process creation options
//!
//! A [`Create`] describes a process: arguments, environment, working
//! directory, timeout, I/O routing and where it runs. [`Create::resolve`]
//! validates the description and turns it into a configured, unstarted
//! [`Executor`]; [`Create::close`] releases whatever resolution set up.
//!
//! `Create` is not safe for concurrent use. Every mutating operation takes
//! `&mut self`.

use crate::executor::{Executor, LocalExecutor, ResolveExecutor};
use crate::io::InputReader;
use crate::options::{Docker, Output, Remote};
use overseer_foundation::{sorted_pairs, Context, Error, ErrorCollector, Result, SectionHasher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Shortest timeout a process may be given
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cleanup action run by [`Create::close`]
pub type Closer = Box<dyn FnOnce() -> Result<()> + Send>;

/// How the supervisor drives the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessImplementation {
    #[default]
    Basic,
    Blocking,
}

enum Cleanup {
    CancelContext(Context),
    CloseOutput,
    Custom(Closer),
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Options for creating a process
#[derive(Default, Serialize, Deserialize)]
pub struct Create {
    pub args: Vec<String>,
    #[serde(default)]
    pub implementation: Option<ProcessImplementation>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Start from an empty environment instead of the supervisor's own
    #[serde(default)]
    pub override_environ: bool,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub output: Output,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Remote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<Docker>,
    #[serde(default, rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Create>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Create>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_timeout: Vec<Create>,
    /// Fed to standard input; takes precedence over `standard_input`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standard_input_bytes: Vec<u8>,

    #[serde(skip)]
    pub standard_input: Option<InputReader>,
    /// Executor constructor; chosen from `docker`/`remote` when unset
    #[serde(skip)]
    pub resolve_executor: Option<ResolveExecutor>,
    #[serde(skip)]
    closers: Vec<Cleanup>,
}

impl std::fmt::Debug for Create {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Create")
            .field("args", &self.args)
            .field("implementation", &self.implementation)
            .field("environment", &self.environment)
            .field("override_environ", &self.override_environ)
            .field("working_directory", &self.working_directory)
            .field("output", &self.output)
            .field("remote", &self.remote)
            .field("docker", &self.docker)
            .field("timeout", &self.timeout)
            .field("tags", &self.tags)
            .field("on_success", &self.on_success.len())
            .field("on_failure", &self.on_failure.len())
            .field("on_timeout", &self.on_timeout.len())
            .field("closers", &self.closers.len())
            .finish()
    }
}

impl Create {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Parse a shell command line.
    ///
    /// Quoting follows POSIX shell rules. Leading `KEY=VALUE` words become
    /// environment entries, as they would for a shell.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let words = shlex::split(line)
            .ok_or_else(|| Error::invalid(format!("cannot parse command line '{}'", line)))?;

        let mut create = Create::default();
        let mut words = words.into_iter().peekable();
        while let Some((key, value)) = words.peek().and_then(|w| env_assignment(w)) {
            create.environment.insert(key, value);
            words.next();
        }
        create.args = words.collect();

        if create.args.is_empty() {
            return Err(Error::invalid("command line contains no command"));
        }
        Ok(create)
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn append_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a tag unless it is already present
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    pub fn with_docker(mut self, docker: Docker) -> Self {
        self.docker = Some(docker);
        self
    }

    pub fn with_remote(mut self, remote: Remote) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.standard_input_bytes = bytes.into();
        self
    }

    pub fn with_resolver(mut self, resolver: ResolveExecutor) -> Self {
        self.resolve_executor = Some(resolver);
        self
    }

    /// Register a cleanup action; closers run in registration order
    pub fn register_closer<F>(&mut self, closer: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.closers.push(Cleanup::Custom(Box::new(closer)));
    }

    // ------------------------------------------------------------------------
    // Validation and resolution
    // ------------------------------------------------------------------------

    /// Whether the process runs on this host
    pub fn is_local(&self) -> bool {
        self.docker.is_none() && self.remote.is_none()
    }

    /// Check the options, filling in defaults.
    ///
    /// Every problem is reported at once. On success the implementation is
    /// defaulted, `timeout` and `timeout_secs` agree, and standard input is
    /// materialized from `standard_input_bytes` when those are set.
    pub fn validate(&mut self) -> Result<()> {
        let mut errors = ErrorCollector::new();

        errors.when(self.args.is_empty(), "must specify arguments");

        errors.when(
            !self.timeout.is_zero() && self.timeout < MIN_TIMEOUT,
            format!("timeout must be zero or at least {:?}, got {:?}", MIN_TIMEOUT, self.timeout),
        );
        errors.when(
            !self.timeout.is_zero()
                && self.timeout_secs != 0
                && self.timeout != Duration::from_secs(self.timeout_secs),
            format!(
                "timeout ({:?}) and timeout_secs ({}) disagree",
                self.timeout, self.timeout_secs
            ),
        );

        if let Err(e) = self.output.validate() {
            errors.add(e);
        }

        if self.is_local() {
            if let Some(dir) = &self.working_directory {
                match std::fs::metadata(dir) {
                    Ok(meta) => errors.when(
                        !meta.is_dir(),
                        format!("working directory '{}' is not a directory", dir.display()),
                    ),
                    Err(e) => errors.add(Error::invalid(format!(
                        "cannot use working directory '{}': {}",
                        dir.display(),
                        e
                    ))),
                }
            }
        }

        errors.when(
            self.docker.is_some() && self.remote.is_some(),
            "cannot specify both docker and remote options",
        );
        if let Some(docker) = self.docker.as_mut() {
            errors.add_result(docker.validate());
        }
        if let Some(remote) = &self.remote {
            errors.add_result(remote.validate());
        }

        for (label, chain) in [
            ("on_success", &mut self.on_success),
            ("on_failure", &mut self.on_failure),
            ("on_timeout", &mut self.on_timeout),
        ] {
            for (i, next) in chain.iter_mut().enumerate() {
                if let Err(e) = next.validate() {
                    errors.add(e.wrap(format!("invalid {}[{}]", label, i)));
                }
            }
        }

        errors.into_result()?;

        self.implementation.get_or_insert(ProcessImplementation::Basic);
        if self.timeout.is_zero() && self.timeout_secs != 0 {
            self.timeout = Duration::from_secs(self.timeout_secs);
        } else if !self.timeout.is_zero() {
            self.timeout_secs = self.timeout.as_secs();
        }
        if !self.standard_input_bytes.is_empty() {
            let bytes = self.standard_input_bytes.clone();
            self.standard_input = Some(Box::new(std::io::Cursor::new(bytes)));
        }

        Ok(())
    }

    fn default_resolver(&self) -> Result<ResolveExecutor> {
        if let Some(docker) = &self.docker {
            return docker.resolver();
        }
        if let Some(remote) = &self.remote {
            return remote.resolver();
        }
        Ok(LocalExecutor::resolver())
    }

    /// Environment handed to the executor.
    ///
    /// Explicit entries come last, sorted by key. Entries are not
    /// deduplicated against the inherited environment.
    fn merged_environment(&self) -> Vec<String> {
        let mut env: Vec<String> = if self.is_local() && !self.override_environ {
            std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect()
        } else {
            Vec::new()
        };
        env.extend(sorted_pairs(&self.environment));
        env
    }

    /// Validate and build a configured, unstarted executor.
    ///
    /// Returns the executor and the deadline derived from `timeout`, if any.
    pub async fn resolve(&mut self, ctx: &Context) -> Result<(Arc<dyn Executor>, Option<Instant>)> {
        ctx.check()?;
        self.validate()?;

        // only a context derived here may be cancelled on failure
        let scoped = if self.timeout.is_zero() {
            None
        } else {
            let child = ctx.with_timeout(self.timeout);
            self.closers.push(Cleanup::CancelContext(child.clone()));
            Some(child)
        };
        let deadline = scoped.as_ref().and_then(Context::deadline);
        let exec_ctx = scoped.clone().unwrap_or_else(|| ctx.clone());
        let abort = |e: Error| {
            if let Some(child) = &scoped {
                child.cancel();
            }
            e
        };

        let resolver = match self.resolve_executor.clone() {
            Some(resolver) => resolver,
            None => self.default_resolver().map_err(abort)?,
        };
        let executor = resolver(exec_ctx, self.args.clone())
            .await
            .map_err(|e| abort(e.wrap("could not resolve process executor")))?;

        // writers may already hold logger senders when a later step fails
        self.closers.push(Cleanup::CloseOutput);
        if let Err(e) = self.configure(executor.as_ref()) {
            let err = match executor.close().await {
                Ok(()) => e,
                Err(cleanup) => e.with_cleanup(cleanup),
            };
            return Err(abort(err));
        }

        debug!(timeout = ?self.timeout, "Resolved executor for {:?}", self.args);
        Ok((executor, deadline))
    }

    /// Apply directory, environment and stdio to a freshly resolved executor
    fn configure(&mut self, executor: &dyn Executor) -> Result<()> {
        if self.working_directory.is_none() && self.is_local() {
            self.working_directory = Some(std::env::current_dir()?);
        }
        if let Some(dir) = &self.working_directory {
            executor.set_dir(dir.clone());
        }

        executor.set_env(self.merged_environment());

        executor.set_stdout(self.output.get_output()?);
        executor.set_stderr(self.output.get_error()?);
        if let Some(input) = self.standard_input.take() {
            executor.set_stdin(input);
        }
        Ok(())
    }

    /// Run every registered closer in order, reporting all failures
    pub fn close(&mut self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for closer in std::mem::take(&mut self.closers) {
            match closer {
                Cleanup::CancelContext(ctx) => ctx.cancel(),
                Cleanup::CloseOutput => {
                    errors.add_result(self.output.close());
                }
                Cleanup::Custom(f) => {
                    errors.add_result(f());
                }
            }
        }
        errors.into_result()
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    /// Stable hash over working directory, arguments, tags and environment
    pub fn hash(&self) -> u64 {
        let dir = self
            .working_directory
            .as_ref()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();

        SectionHasher::new()
            .section("dir", &[dir])
            .section("args", &self.args)
            .section("tags", &self.tags)
            .section("env", &sorted_pairs(&self.environment))
            .finish()
    }

    /// Deep copy without the registered closers or a live stdin reader
    pub fn copy(&self) -> Create {
        Create {
            args: self.args.clone(),
            implementation: self.implementation,
            environment: self.environment.clone(),
            override_environ: self.override_environ,
            working_directory: self.working_directory.clone(),
            output: self.output.clone(),
            remote: self.remote.clone(),
            docker: self.docker.clone(),
            timeout: self.timeout,
            timeout_secs: self.timeout_secs,
            tags: self.tags.clone(),
            on_success: self.on_success.iter().map(Create::copy).collect(),
            on_failure: self.on_failure.iter().map(Create::copy).collect(),
            on_timeout: self.on_timeout.iter().map(Create::copy).collect(),
            standard_input_bytes: self.standard_input_bytes.clone(),
            standard_input: None,
            resolve_executor: self.resolve_executor.clone(),
            closers: Vec::new(),
        }
    }
}

fn env_assignment(word: &str) -> Option<(String, String)> {
    let (key, value) = word.split_once('=')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
