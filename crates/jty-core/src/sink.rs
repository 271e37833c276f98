//! Shared line-oriented output sinks.

use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// A cloneable handle to a writer shared between worker threads.
///
/// Each [`write_line`](SharedWriter::write_line) call holds the lock for the
/// whole line, so lines from different workers never interleave.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    /// Wrap a writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Shared handle to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Shared handle to the process's standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Write `line` followed by a newline and flush.
    pub fn write_line(&self, line: impl fmt::Display) -> io::Result<()> {
        let mut w = self.inner.lock();
        writeln!(w, "{line}")?;
        w.flush()
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter").finish_non_exhaustive()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// An in-memory byte buffer that can be handed out as a writer and read back
/// later.
///
/// Cloning yields a handle to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents written so far, decoded lossily as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// A [`SharedWriter`] that appends to this buffer.
    pub fn writer(&self) -> SharedWriter {
        SharedWriter::new(self.clone())
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
