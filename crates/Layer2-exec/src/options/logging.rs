//! Process output loggers
//!
//! Provides:
//! - [`LoggerConfig`] - declarative logger description, resolved to a sender once
//! - [`Sender`] - line-oriented log sink
//! - [`InMemoryLog`] - ring buffer with live subscribers
//! - [`SenderWriter`] - adapts a sender into a byte writer

use chrono::{DateTime, Utc};
use overseer_foundation::{Error, ErrorCollector, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Broadcast channel capacity for in-memory subscribers
const BROADCAST_CAPACITY: usize = 1000;

/// Default in-memory capacity
pub const DEFAULT_CAPACITY: usize = 10000;

/// Severity of a captured line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// A single captured line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub content: String,
    pub line_number: usize,
}

impl LogEntry {
    pub fn new(level: LogLevel, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            content: content.into(),
            line_number: 0,
        }
    }

    pub fn format(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level.as_str(),
            self.content
        )
    }
}

/// Where a logger writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoggerType {
    /// Keep the most recent `capacity` lines in memory
    InMemory {
        #[serde(default = "default_capacity")]
        capacity: usize,
    },
    /// Emit `tracing` events in the host application
    Tracing,
    /// Append to a file
    File { path: PathBuf },
    /// The supervisor's own standard streams
    Inherit {
        #[serde(default)]
        stderr: bool,
    },
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for LoggerType {
    fn default() -> Self {
        LoggerType::InMemory {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Line-oriented log sink
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    /// Record one line (without its trailing newline)
    fn send(&self, level: LogLevel, line: &str) -> Result<()>;

    /// Push out anything held back by buffering
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Flush and release the sink. Closing twice is harmless.
    fn close(&self) -> Result<()>;

    /// The in-memory log behind this sender, if there is one
    fn in_memory(&self) -> Option<Arc<InMemoryLog>> {
        None
    }
}

impl std::fmt::Debug for dyn Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sender({})", self.name())
    }
}

/// Ring buffer of captured lines with live subscribers
#[derive(Debug)]
pub struct InMemoryLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    line_count: Mutex<usize>,
    tx: broadcast::Sender<LogEntry>,
}

impl InMemoryLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            line_count: Mutex::new(0),
            tx,
        }
    }

    pub fn push(&self, mut entry: LogEntry) {
        {
            let mut count = self.line_count.lock();
            *count += 1;
            entry.line_number = *count;
        }

        // Nobody listening is fine
        let _ = self.tx.send(entry.clone());

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Subscribe to lines as they arrive
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Last `n` entries, oldest first
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Captured lines joined with newlines
    pub fn text(&self) -> String {
        self.entries
            .lock()
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Lines seen since creation, including evicted ones
    pub fn line_count(&self) -> usize {
        *self.line_count.lock()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

enum Sink {
    InMemory(Arc<InMemoryLog>),
    Tracing,
    File(Mutex<File>),
    Inherit { stderr: bool },
}

/// Sender built from a [`LoggerConfig`]
struct LoggerSender {
    name: String,
    threshold: LogLevel,
    buffer: usize,
    pending: Mutex<Vec<(LogLevel, String)>>,
    closed: Mutex<bool>,
    sink: Sink,
}

impl LoggerSender {
    fn deliver(&self, level: LogLevel, line: &str) -> Result<()> {
        match &self.sink {
            Sink::InMemory(log) => {
                log.push(LogEntry::new(level, line));
                Ok(())
            }
            Sink::Tracing => {
                let logger = self.name.as_str();
                match level {
                    LogLevel::Trace => tracing::trace!(logger = %logger, "{}", line),
                    LogLevel::Debug => tracing::debug!(logger = %logger, "{}", line),
                    LogLevel::Info => tracing::info!(logger = %logger, "{}", line),
                    LogLevel::Warn => tracing::warn!(logger = %logger, "{}", line),
                    LogLevel::Error => tracing::error!(logger = %logger, "{}", line),
                }
                Ok(())
            }
            Sink::File(file) => {
                writeln!(file.lock(), "{}", line)?;
                Ok(())
            }
            Sink::Inherit { stderr: true } => {
                writeln!(std::io::stderr().lock(), "{}", line)?;
                Ok(())
            }
            Sink::Inherit { stderr: false } => {
                writeln!(std::io::stdout().lock(), "{}", line)?;
                Ok(())
            }
        }
    }

    fn drain(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut errors = ErrorCollector::new();
        for (level, line) in pending {
            errors.add_result(self.deliver(level, &line));
        }
        if let Sink::File(file) = &self.sink {
            errors.add_result(file.lock().flush().map_err(Error::from));
        }
        errors.into_result()
    }
}

impl Sender for LoggerSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, level: LogLevel, line: &str) -> Result<()> {
        if level < self.threshold {
            return Ok(());
        }
        if *self.closed.lock() {
            return Err(Error::lifecycle(format!("logger '{}' is closed", self.name)));
        }
        if self.buffer == 0 {
            return self.deliver(level, line);
        }

        let full = {
            let mut pending = self.pending.lock();
            pending.push((level, line.to_string()));
            pending.len() >= self.buffer
        };
        if full {
            self.drain()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.drain()
    }

    fn close(&self) -> Result<()> {
        let result = self.drain();
        *self.closed.lock() = true;
        result
    }

    fn in_memory(&self) -> Option<Arc<InMemoryLog>> {
        match &self.sink {
            Sink::InMemory(log) => Some(Arc::clone(log)),
            _ => None,
        }
    }
}

/// Sends every line to several senders
pub struct MultiSender {
    name: String,
    senders: Vec<Arc<dyn Sender>>,
}

impl MultiSender {
    pub fn new(name: impl Into<String>, senders: Vec<Arc<dyn Sender>>) -> Self {
        Self {
            name: name.into(),
            senders,
        }
    }
}

impl Sender for MultiSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, level: LogLevel, line: &str) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for sender in &self.senders {
            errors.add_result(sender.send(level, line));
        }
        errors.into_result()
    }

    fn flush(&self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for sender in &self.senders {
            errors.add_result(sender.flush());
        }
        errors.into_result()
    }

    fn close(&self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for sender in &self.senders {
            errors.add_result(sender.close());
        }
        errors.into_result()
    }

    fn in_memory(&self) -> Option<Arc<InMemoryLog>> {
        self.senders.iter().find_map(|s| s.in_memory())
    }
}

// ============================================================================
// LoggerConfig
// ============================================================================

/// Declarative logger for process output
#[derive(Serialize, Deserialize, Default)]
pub struct LoggerConfig {
    #[serde(flatten)]
    pub logger_type: LoggerType,
    #[serde(default)]
    pub name: String,
    /// Lines below this level are dropped
    #[serde(default)]
    pub level: LogLevel,
    /// Lines held back before delivery; 0 delivers immediately
    #[serde(default)]
    pub buffer: usize,
    #[serde(default)]
    pub options: HashMap<String, String>,

    #[serde(skip)]
    sender: Mutex<Option<Arc<dyn Sender>>>,
}

impl Clone for LoggerConfig {
    /// Clones the description only; the copy resolves its own sender.
    fn clone(&self) -> Self {
        Self {
            logger_type: self.logger_type.clone(),
            name: self.name.clone(),
            level: self.level,
            buffer: self.buffer,
            options: self.options.clone(),
            sender: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for LoggerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerConfig")
            .field("logger_type", &self.logger_type)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("buffer", &self.buffer)
            .field("options", &self.options)
            .field("resolved", &self.sender.lock().is_some())
            .finish()
    }
}

impl LoggerConfig {
    pub fn new(logger_type: LoggerType, name: impl Into<String>) -> Self {
        Self {
            logger_type,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn in_memory(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(LoggerType::InMemory { capacity }, name)
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_buffer(mut self, lines: usize) -> Self {
        self.buffer = lines;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = ErrorCollector::new();
        match &self.logger_type {
            LoggerType::InMemory { capacity } => {
                errors.when(*capacity == 0, "in-memory logger capacity must be positive")
            }
            LoggerType::File { path } => {
                errors.when(path.as_os_str().is_empty(), "file logger requires a path")
            }
            LoggerType::Tracing | LoggerType::Inherit { .. } => {}
        }
        errors.into_result()
    }

    /// Sender for this logger, built on first use and reused afterwards
    pub fn resolve(&self) -> Result<Arc<dyn Sender>> {
        let mut slot = self.sender.lock();
        if let Some(sender) = slot.as_ref() {
            return Ok(Arc::clone(sender));
        }

        self.validate()?;
        let sink = match &self.logger_type {
            LoggerType::InMemory { capacity } => {
                Sink::InMemory(Arc::new(InMemoryLog::new(*capacity)))
            }
            LoggerType::Tracing => Sink::Tracing,
            LoggerType::File { path } => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        Error::from(e).wrap(format!("opening log file {}", path.display()))
                    })?;
                Sink::File(Mutex::new(file))
            }
            LoggerType::Inherit { stderr } => Sink::Inherit { stderr: *stderr },
        };

        let sender: Arc<dyn Sender> = Arc::new(LoggerSender {
            name: self.name.clone(),
            threshold: self.level,
            buffer: self.buffer,
            pending: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
            sink,
        });
        *slot = Some(Arc::clone(&sender));
        Ok(sender)
    }
}

// ============================================================================
// SenderWriter
// ============================================================================

/// Byte writer that forwards complete lines to a [`Sender`]
///
/// The sender may be shared with other writers, so closing the writer
/// flushes it but leaves it open.
#[derive(Debug)]
pub struct SenderWriter {
    sender: Arc<dyn Sender>,
    level: LogLevel,
    partial: Vec<u8>,
    closed: bool,
}

impl SenderWriter {
    pub fn new(sender: Arc<dyn Sender>, level: LogLevel) -> Self {
        Self {
            sender,
            level,
            partial: Vec::new(),
            closed: false,
        }
    }

    pub fn sender(&self) -> Arc<dyn Sender> {
        Arc::clone(&self.sender)
    }

    fn send_line(&self, line: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(line);
        self.sender.send(self.level, line.trim_end_matches('\r'))
    }

    /// Send the trailing partial line and flush the sender. Later calls
    /// do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors = ErrorCollector::new();
        if !self.partial.is_empty() {
            let partial = std::mem::take(&mut self.partial);
            errors.add_result(self.send_line(&partial));
        }
        errors.add_result(self.sender.flush());
        errors.into_result()
    }
}

impl Write for SenderWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "log writer is closed",
            ));
        }
        self.partial.extend_from_slice(buf);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.send_line(&line[..line.len() - 1])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sender
            .flush()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

/// Snapshot of the senders an [`Output`](super::Output) resolved
#[derive(Debug, Clone)]
pub struct CachedLogger {
    pub id: String,
    pub accessed: DateTime<Utc>,
    pub output: Option<Arc<dyn Sender>>,
    pub error: Option<Arc<dyn Sender>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sender_resolved_once() {
        let config = LoggerConfig::in_memory("proc", 10);
        let a = config.resolve().unwrap();
        let b = config.resolve().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // clones start unresolved
        let copy = config.clone();
        assert!(!Arc::ptr_eq(&a, &copy.resolve().unwrap()));
    }

    #[test]
    fn test_in_memory_ring_buffer() {
        let log = InMemoryLog::new(2);
        for line in ["one", "two", "three"] {
            log.push(LogEntry::new(LogLevel::Info, line));
        }
        assert_eq!(log.text(), "two\nthree");
        assert_eq!(log.line_count(), 3);
        assert_eq!(log.tail(1)[0].content, "three");
        assert_eq!(log.tail(1)[0].line_number, 3);
    }

    #[tokio::test]
    async fn test_in_memory_subscribe() {
        let log = InMemoryLog::new(10);
        let mut rx = log.subscribe();
        log.push(LogEntry::new(LogLevel::Info, "live"));
        assert_eq!(rx.recv().await.unwrap().content, "live");
    }

    #[test]
    fn test_writer_splits_lines_and_flushes_partial_on_close() {
        let config = LoggerConfig::in_memory("proc", 10);
        let sender = config.resolve().unwrap();
        let mut writer = SenderWriter::new(Arc::clone(&sender), LogLevel::Info);

        writer.write_all(b"first\nsec").unwrap();
        writer.write_all(b"ond\r\nthi").unwrap();
        let log = sender.in_memory().unwrap();
        assert_eq!(log.text(), "first\nsecond");

        writer.close().unwrap();
        assert_eq!(log.text(), "first\nsecond\nthi");
        assert!(writer.write_all(b"late\n").is_err());
        writer.close().unwrap();

        // the sender outlives the writer
        sender.send(LogLevel::Info, "direct").unwrap();
        assert_eq!(log.text(), "first\nsecond\nthi\ndirect");
    }

    #[test]
    fn test_level_threshold() {
        let config = LoggerConfig::in_memory("errors", 10).with_level(LogLevel::Error);
        let sender = config.resolve().unwrap();
        sender.send(LogLevel::Info, "dropped").unwrap();
        sender.send(LogLevel::Error, "kept").unwrap();
        assert_eq!(sender.in_memory().unwrap().text(), "kept");
    }

    #[test]
    fn test_buffered_lines_wait_for_close() {
        let config = LoggerConfig::in_memory("buffered", 10).with_buffer(3);
        let sender = config.resolve().unwrap();
        sender.send(LogLevel::Info, "a").unwrap();
        sender.send(LogLevel::Info, "b").unwrap();
        let log = sender.in_memory().unwrap();
        assert_eq!(log.line_count(), 0);

        sender.close().unwrap();
        assert_eq!(log.text(), "a\nb");
        assert!(sender.send(LogLevel::Info, "late").is_err());
    }

    #[test]
    fn test_file_logger_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proc.log");
        std::fs::write(&path, "existing\n").unwrap();

        let config = LoggerConfig::new(LoggerType::File { path: path.clone() }, "file");
        let sender = config.resolve().unwrap();
        sender.send(LogLevel::Info, "appended").unwrap();
        sender.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "existing\nappended\n");
    }

    #[test]
    fn test_multi_sender_fans_out() {
        let a = LoggerConfig::in_memory("a", 10).resolve().unwrap();
        let b = LoggerConfig::in_memory("b", 10).resolve().unwrap();
        let multi = MultiSender::new("both", vec![Arc::clone(&a), Arc::clone(&b)]);
        multi.send(LogLevel::Warn, "hello").unwrap();
        assert_eq!(a.in_memory().unwrap().text(), "hello");
        assert_eq!(b.in_memory().unwrap().text(), "hello");
    }

    #[test]
    fn test_validate() {
        assert!(LoggerConfig::in_memory("x", 0).validate().is_err());
        let file = LoggerConfig::new(LoggerType::File { path: PathBuf::new() }, "f");
        assert!(file.validate().is_err());
        assert!(LoggerConfig::new(LoggerType::Tracing, "t").validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: LoggerConfig = serde_json::from_str(
            r#"{"type": "in_memory", "capacity": 5, "name": "proc", "level": "warn"}"#,
        )
        .unwrap();
        assert_eq!(config.logger_type, LoggerType::InMemory { capacity: 5 });
        assert_eq!(config.level, LogLevel::Warn);
    }
}
