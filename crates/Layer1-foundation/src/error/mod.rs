//! Error types for overseer
//!
//! Every failure in the supervision core flows through [`Error`]. Validation
//! problems and cleanup failures are gathered with [`ErrorCollector`] so a
//! caller sees all of them at once.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// overseer error type
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    // ========================================================================
    // Lifecycle ordering
    // ========================================================================
    #[error("{0}")]
    Lifecycle(String),

    // ========================================================================
    // Native clients (docker daemon, ssh, tunnel)
    // ========================================================================
    #[error("{op}: {message}")]
    Transport { op: String, message: String },

    // ========================================================================
    // Process outcome
    // ========================================================================
    #[error("process exited with code {code}")]
    Exit { code: i32 },

    #[error("process terminated by signal {signal}")]
    Signaled { signal: i32 },

    // ========================================================================
    // Context
    // ========================================================================
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    // ========================================================================
    // Conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML error: {0}")]
    Toml(String),

    // ========================================================================
    // Aggregation and wrapping
    // ========================================================================
    #[error("{}", render_multiple(.0))]
    Multiple(Vec<Error>),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn render_multiple(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Validation error with a single message
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Validation(vec![message.into()])
    }

    /// Lifecycle-order error helper
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Error::Lifecycle(message.into())
    }

    /// Transport error helper
    pub fn transport(op: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Transport {
            op: op.into(),
            message: message.to_string(),
        }
    }

    /// Wrap this error with a description of the failed operation
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Fold a cleanup error into this one, keeping both.
    pub fn with_cleanup(self, cleanup: Error) -> Self {
        match self {
            Error::Multiple(mut errors) => {
                errors.push(cleanup);
                Error::Multiple(errors)
            }
            other => Error::Multiple(vec![other, cleanup]),
        }
    }

    /// Whether this error is a context cancellation or deadline
    pub fn is_context(&self) -> bool {
        match self {
            Error::Cancelled | Error::DeadlineExceeded => true,
            Error::Context { source, .. } => source.is_context(),
            _ => false,
        }
    }

    /// Whether this error describes a process outcome rather than a fault
    pub fn is_process_outcome(&self) -> bool {
        matches!(self, Error::Exit { .. } | Error::Signaled { .. })
    }

    /// Whether this error is a configuration problem
    pub fn is_validation(&self) -> bool {
        match self {
            Error::Validation(_) => true,
            Error::Context { source, .. } => source.is_validation(),
            Error::Multiple(errors) => errors.iter().all(|e| e.is_validation()),
            _ => false,
        }
    }
}

// ============================================================================
// From impls
// ============================================================================

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Toml(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

// ============================================================================
// ErrorCollector
// ============================================================================

/// Gathers errors without short-circuiting.
///
/// Validation messages are merged into one [`Error::Validation`]; any other
/// error is kept as-is. `into_result` returns `Ok(())` when nothing was added.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    messages: Vec<String>,
    errors: Vec<Error>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validation message when `failed` holds.
    pub fn when(&mut self, failed: bool, message: impl Into<String>) {
        if failed {
            self.messages.push(message.into());
        }
    }

    pub fn add(&mut self, error: Error) {
        match error {
            Error::Validation(messages) => self.messages.extend(messages),
            other => self.errors.push(other),
        }
    }

    pub fn add_result<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.add(e);
                None
            }
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.messages.is_empty() || !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_errors()
    }

    pub fn into_result(self) -> Result<()> {
        let mut errors = self.errors;
        if !self.messages.is_empty() {
            errors.insert(0, Error::Validation(self.messages));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}
