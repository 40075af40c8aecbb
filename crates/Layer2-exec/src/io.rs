//! Process stream plumbing
//!
//! [`OutputWriter`] is the cloneable sink every backend copies process output
//! into. A writer with no target is the discard writer, which is how "no
//! output configured" is represented without comparing pointers.

use overseer_foundation::Result;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Standard input source handed to an executor
pub type InputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Cloneable, shareable output sink
#[derive(Clone, Default)]
pub struct OutputWriter {
    inner: Option<Arc<Mutex<dyn Write + Send>>>,
}

impl OutputWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        let inner: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(writer));
        Self { inner: Some(inner) }
    }

    /// Writer over a sink the caller keeps a handle to
    pub fn from_shared<W: Write + Send + 'static>(shared: Arc<Mutex<W>>) -> Self {
        let inner: Arc<Mutex<dyn Write + Send>> = shared;
        Self { inner: Some(inner) }
    }

    /// Writer that drops everything
    pub fn discard() -> Self {
        Self { inner: None }
    }

    /// Fan every write out to all `writers`
    pub fn multi(writers: Vec<OutputWriter>) -> Self {
        let writers: Vec<OutputWriter> = writers.into_iter().filter(|w| !w.is_discard()).collect();
        match writers.len() {
            0 => Self::discard(),
            1 => writers.into_iter().next().unwrap_or_default(),
            _ => Self::new(MultiWriter { writers }),
        }
    }

    pub fn is_discard(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether both handles point at the same sink
    pub fn same(&self, other: &OutputWriter) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for OutputWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_discard() {
            write!(f, "OutputWriter(discard)")
        } else {
            write!(f, "OutputWriter(..)")
        }
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.inner {
            Some(inner) => inner.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.inner {
            Some(inner) => inner.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Writes go to every writer; the first failure stops the write.
struct MultiWriter {
    writers: Vec<OutputWriter>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for writer in &mut self.writers {
            writer.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for writer in &mut self.writers {
            writer.flush()?;
        }
        Ok(())
    }
}

/// In-memory sink whose contents can be read back
#[derive(Clone, Default)]
pub struct SharedBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> OutputWriter {
        OutputWriter::new(self.clone())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.data.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Copy a process stream into `writer` until EOF.
pub(crate) async fn copy_to_writer<R>(mut reader: R, mut writer: OutputWriter) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Feed `input` into a process stdin, closing it at EOF.
///
/// A process that exits without reading its input closes the pipe early;
/// that broken pipe is not an error.
pub(crate) async fn copy_from_reader<W>(mut input: InputReader, mut stdin: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(&mut input, &mut stdin).await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    match stdin.shutdown().await {
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
        _ => Ok(copied),
    }
}
