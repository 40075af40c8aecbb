//! Output routing for a process
//!
//! An [`Output`] decides where a process's stdout and stderr go: raw
//! writers, logger fan-out, both, or nowhere. One stream may be redirected
//! onto the other, but never both ways at once.

use crate::io::OutputWriter;
use crate::options::logging::{
    CachedLogger, LogLevel, LoggerConfig, MultiSender, Sender, SenderWriter,
};
use chrono::Utc;
use overseer_foundation::{Error, ErrorCollector, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type SharedSenderWriter = Arc<Mutex<SenderWriter>>;

/// Output options
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Output {
    /// Raw stdout sink; discard when unset
    #[serde(skip)]
    pub output: OutputWriter,
    /// Raw stderr sink; discard when unset
    #[serde(skip)]
    pub error: OutputWriter,
    #[serde(default)]
    pub suppress_output: bool,
    #[serde(default)]
    pub suppress_error: bool,
    #[serde(default)]
    pub send_output_to_error: bool,
    #[serde(default)]
    pub send_error_to_output: bool,
    /// Loggers receiving both streams
    #[serde(default)]
    pub loggers: Vec<LoggerConfig>,

    #[serde(skip)]
    pub output_sender: Option<SharedSenderWriter>,
    #[serde(skip)]
    pub error_sender: Option<SharedSenderWriter>,
    #[serde(skip)]
    pub resolved_output: Option<OutputWriter>,
    #[serde(skip)]
    pub resolved_error: Option<OutputWriter>,
}

impl Clone for Output {
    /// Copies the routing; resolved writers are not shared with the copy.
    fn clone(&self) -> Self {
        Self {
            output: self.output.clone(),
            error: self.error.clone(),
            suppress_output: self.suppress_output,
            suppress_error: self.suppress_error,
            send_output_to_error: self.send_output_to_error,
            send_error_to_output: self.send_error_to_output,
            loggers: self.loggers.clone(),
            ..Default::default()
        }
    }
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, writer: OutputWriter) -> Self {
        self.output = writer;
        self
    }

    pub fn with_error(mut self, writer: OutputWriter) -> Self {
        self.error = writer;
        self
    }

    pub fn with_logger(mut self, logger: LoggerConfig) -> Self {
        self.loggers.push(logger);
        self
    }

    fn has_loggers(&self) -> bool {
        !self.loggers.is_empty()
    }

    fn output_is_null(&self) -> bool {
        self.output.is_discard()
    }

    fn error_is_null(&self) -> bool {
        self.error.is_discard()
    }

    /// Reject contradictory routing before any writer is resolved
    pub fn validate(&self) -> Result<()> {
        let mut errors = ErrorCollector::new();

        errors.when(
            self.suppress_output && !self.output_is_null(),
            "cannot suppress output if output is defined",
        );
        errors.when(
            self.suppress_error && !self.error_is_null(),
            "cannot suppress error if error is defined",
        );
        errors.when(
            self.suppress_output && self.send_output_to_error,
            "cannot suppress output and redirect it to error",
        );
        errors.when(
            self.suppress_error && self.send_error_to_output,
            "cannot suppress error and redirect it to output",
        );
        errors.when(
            self.send_output_to_error && self.send_error_to_output,
            "cannot create redirect cycle between output and error",
        );
        errors.when(
            self.send_output_to_error && self.error_is_null() && !self.has_loggers(),
            "cannot redirect output to error without a defined error writer",
        );
        errors.when(
            self.send_error_to_output && self.output_is_null() && !self.has_loggers(),
            "cannot redirect error to output without a defined output writer",
        );

        for logger in &self.loggers {
            if let Err(e) = logger.validate() {
                errors.add(e.wrap(format!("invalid logger '{}'", logger.name)));
            }
        }

        errors.into_result()
    }

    /// Sender fanning out to every logger, each resolved once
    fn logger_sender(&self) -> Result<Option<Arc<dyn Sender>>> {
        let mut senders = Vec::with_capacity(self.loggers.len());
        for logger in &self.loggers {
            senders.push(logger.resolve()?);
        }

        Ok(match senders.len() {
            0 => None,
            1 => senders.pop(),
            _ => Some(Arc::new(MultiSender::new("output", senders))),
        })
    }

    fn stream_writer(
        raw: &OutputWriter,
        sender: Option<Arc<dyn Sender>>,
        level: LogLevel,
    ) -> (OutputWriter, Option<SharedSenderWriter>) {
        let Some(sender) = sender else {
            return (raw.clone(), None);
        };

        let shared = Arc::new(Mutex::new(SenderWriter::new(sender, level)));
        let logged = OutputWriter::from_shared(Arc::clone(&shared));
        let writer = if raw.is_discard() {
            logged
        } else {
            OutputWriter::multi(vec![raw.clone(), logged])
        };
        (writer, Some(shared))
    }

    /// Writer for the process's stdout, cached after the first call
    pub fn get_output(&mut self) -> Result<OutputWriter> {
        if self.send_output_to_error {
            return self.get_error();
        }
        if self.suppress_output {
            return Ok(OutputWriter::discard());
        }
        if let Some(writer) = &self.resolved_output {
            return Ok(writer.clone());
        }

        let (writer, sender) =
            Self::stream_writer(&self.output, self.logger_sender()?, LogLevel::Info);
        self.output_sender = sender;
        self.resolved_output = Some(writer.clone());
        Ok(writer)
    }

    /// Writer for the process's stderr, cached after the first call
    pub fn get_error(&mut self) -> Result<OutputWriter> {
        if self.send_error_to_output {
            return self.get_output();
        }
        if self.suppress_error {
            return Ok(OutputWriter::discard());
        }
        if let Some(writer) = &self.resolved_error {
            return Ok(writer.clone());
        }

        let (writer, sender) =
            Self::stream_writer(&self.error, self.logger_sender()?, LogLevel::Error);
        self.error_sender = sender;
        self.resolved_error = Some(writer.clone());
        Ok(writer)
    }

    /// Snapshot of the resolved logger senders under `id`
    pub fn cached_logger(&self, id: impl Into<String>) -> CachedLogger {
        CachedLogger {
            id: id.into(),
            accessed: Utc::now(),
            output: self.output_sender.as_ref().map(|w| w.lock().sender()),
            error: self.error_sender.as_ref().map(|w| w.lock().sender()),
        }
    }

    /// Close the logger wrappers created by `get_output`/`get_error`.
    ///
    /// Trailing partial lines are sent and the loggers flushed; the loggers
    /// themselves stay open.
    pub fn close(&mut self) -> Result<()> {
        let mut errors = ErrorCollector::new();

        if let Some(sender) = &self.output_sender {
            errors.add_result(sender.lock().close());
        }
        if let Some(sender) = &self.error_sender {
            errors.add_result(sender.lock().close());
            // Output went through the error wrapper; a second close is a
            // no-op on the wrapper
            if self.suppress_output || self.send_output_to_error {
                errors.add_result(sender.lock().close());
            }
        }

        errors
            .into_result()
            .map_err(|e: Error| e.wrap("closing output loggers"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;
    use std::io::Write;

    #[test]
    fn test_redirect_cycle_rejected() {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let opts = Output {
            output: out.writer(),
            error: err.writer(),
            send_output_to_error: true,
            send_error_to_output: true,
            ..Default::default()
        };
        let e = opts.validate().unwrap_err();
        assert!(e.to_string().contains("redirect cycle"));
    }

    #[test]
    fn test_suppress_contradictions() {
        let opts = Output {
            output: SharedBuffer::new().writer(),
            suppress_output: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = Output {
            error: SharedBuffer::new().writer(),
            suppress_error: true,
            send_error_to_output: true,
            ..Default::default()
        };
        match opts.validate() {
            Err(Error::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_redirect_needs_target() {
        let opts = Output {
            send_output_to_error: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = Output {
            send_output_to_error: true,
            ..Default::default()
        }
        .with_logger(LoggerConfig::in_memory("log", 10));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_unset_streams_discard() {
        let mut opts = Output::default();
        opts.validate().unwrap();
        assert!(opts.get_output().unwrap().is_discard());
        assert!(opts.get_error().unwrap().is_discard());

        let mut opts = Output {
            output: OutputWriter::discard(),
            ..Default::default()
        };
        assert!(opts.get_output().unwrap().is_discard());
    }

    #[test]
    fn test_redirect_short_circuit() {
        let w1 = SharedBuffer::new().writer();
        let w2 = SharedBuffer::new().writer();
        let mut opts = Output {
            output: w1,
            error: w2.clone(),
            send_output_to_error: true,
            ..Default::default()
        };
        assert!(opts.get_output().unwrap().same(&w2));

        let mut opts = Output {
            output: w2.clone(),
            error: SharedBuffer::new().writer(),
            send_error_to_output: true,
            ..Default::default()
        };
        assert!(opts.get_error().unwrap().same(&w2));
    }

    #[test]
    fn test_writers_are_cached() {
        let mut opts = Output::default().with_logger(LoggerConfig::in_memory("log", 10));
        let first = opts.get_output().unwrap();
        let second = opts.get_output().unwrap();
        assert!(first.same(&second));
    }

    #[test]
    fn test_raw_writer_and_logger_both_receive() {
        let raw = SharedBuffer::new();
        let mut opts = Output::default()
            .with_output(raw.writer())
            .with_logger(LoggerConfig::in_memory("log", 10));

        let mut writer = opts.get_output().unwrap();
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(raw.contents(), "hello\n");

        let cached = opts.cached_logger("proc-1");
        assert_eq!(cached.id, "proc-1");
        let log = cached.output.and_then(|s| s.in_memory()).unwrap();
        assert_eq!(log.text(), "hello");
        assert!(cached.error.is_none());
    }

    #[test]
    fn test_streams_share_logger_sender() {
        let mut opts = Output::default().with_logger(LoggerConfig::in_memory("log", 10));
        let mut out = opts.get_output().unwrap();
        let mut err = opts.get_error().unwrap();
        out.write_all(b"to stdout\n").unwrap();
        err.write_all(b"to stderr\n").unwrap();

        let cached = opts.cached_logger("p");
        let log = cached.output.and_then(|s| s.in_memory()).unwrap();
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].level, LogLevel::Error);
    }

    #[test]
    fn test_close_flushes_partial_line() {
        let mut opts = Output {
            send_output_to_error: true,
            ..Default::default()
        }
        .with_logger(LoggerConfig::in_memory("log", 10));
        opts.validate().unwrap();

        let mut writer = opts.get_output().unwrap();
        writer.write_all(b"no newline").unwrap();
        let cached = opts.cached_logger("p");
        assert!(cached.output.is_none());
        let log = cached.error.and_then(|s| s.in_memory()).unwrap();
        assert_eq!(log.line_count(), 0);

        opts.close().unwrap();
        assert_eq!(log.text(), "no newline");
    }

    #[test]
    fn test_close_keeps_stderr_tail_with_shared_logger() {
        let mut opts =
            Output::default().with_logger(LoggerConfig::in_memory("log", 10).with_buffer(4));
        opts.validate().unwrap();

        opts.get_output().unwrap().write_all(b"out line\n").unwrap();
        opts.get_error().unwrap().write_all(b"err tail no newline").unwrap();
        let log = opts.cached_logger("p").output.and_then(|s| s.in_memory()).unwrap();
        assert_eq!(log.line_count(), 0);

        opts.close().unwrap();
        assert_eq!(log.text(), "out line\nerr tail no newline");
        opts.close().unwrap();
    }

    #[test]
    fn test_multiple_loggers() {
        let mut opts = Output::default()
            .with_logger(LoggerConfig::in_memory("a", 10))
            .with_logger(LoggerConfig::in_memory("b", 10));
        opts.get_output().unwrap().write_all(b"x\n").unwrap();
        for logger in &opts.loggers {
            let sender = logger.resolve().unwrap();
            assert_eq!(sender.in_memory().unwrap().text(), "x");
        }
    }

    #[test]
    fn test_clone_does_not_share_resolution() {
        let mut opts = Output::default().with_logger(LoggerConfig::in_memory("log", 10));
        let first = opts.get_output().unwrap();
        let mut copy = opts.clone();
        assert!(!copy.get_output().unwrap().same(&first));
    }
}
