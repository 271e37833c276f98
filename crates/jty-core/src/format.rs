//! Output formats for the write stage.
//!
//! An [`OutputFormat`] opens a [`DocumentStream`] over an output writer.
//! The stream separates documents the way the format's own serializer does:
//! nothing before the first document, a separator before each later one.
//! Stream-level framing (the leading marker and the terminator) is added by
//! the pipeline, not by the format.

use serde_json::Value;
use std::io::{self, Write};

/// A target serialization format.
pub trait OutputFormat: Send + Sync {
    /// Human-readable format name, e.g. `YAML`.
    fn name(&self) -> &str;

    /// Start a document stream writing to `out`.
    fn begin<'w>(&self, out: &'w mut dyn Write) -> Box<dyn DocumentStream + 'w>;
}

/// An open stream of documents.
pub trait DocumentStream {
    /// Serialize `value` as the next document.
    fn write_document(&mut self, value: &Value) -> Result<(), SerializeError>;

    /// Finish the stream, flushing any buffered state.
    fn close(self: Box<Self>) -> Result<(), SerializeError>;
}

/// Errors that can occur while serializing documents.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// YAML via `serde_yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlFormat;

impl OutputFormat for YamlFormat {
    fn name(&self) -> &str {
        "YAML"
    }

    fn begin<'w>(&self, out: &'w mut dyn Write) -> Box<dyn DocumentStream + 'w> {
        Box::new(YamlStream { out, written: 0 })
    }
}

struct YamlStream<'w> {
    out: &'w mut dyn Write,
    written: usize,
}

impl DocumentStream for YamlStream<'_> {
    fn write_document(&mut self, value: &Value) -> Result<(), SerializeError> {
        let text = serde_yaml::to_string(value)?;
        if self.written > 0 {
            self.out.write_all(b"---\n")?;
        }
        self.out.write_all(text.as_bytes())?;
        self.written += 1;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), SerializeError> {
        self.out.flush()?;
        Ok(())
    }
}
