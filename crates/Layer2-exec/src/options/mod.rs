//! Process options
//!
//! - `Create` - declarative process description and its resolution pipeline
//! - `Output` - stdout/stderr routing and logger fan-out
//! - `LoggerConfig` - loggers receiving process output
//! - `Docker` / `Remote` - where a non-local process runs

pub mod create;
pub mod docker;
pub mod logging;
pub mod output;
pub mod remote;

pub use create::{Closer, Create, ProcessImplementation, MIN_TIMEOUT};
pub use docker::{Docker, PLATFORMS};
pub use logging::{
    CachedLogger, InMemoryLog, LogEntry, LogLevel, LoggerConfig, LoggerType, MultiSender, Sender,
    SenderWriter,
};
pub use output::Output;
pub use remote::{Remote, DEFAULT_SSH_PORT};
