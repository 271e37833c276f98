//! The CLI driver: turns flags and stdin into pipeline submissions.

use crate::flags::Flags;
use jty_core::{Diagnostics, Evaluator, FileSystem, Pipeline, PipelineError, SharedWriter};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::str::Utf8Error;
use std::sync::Arc;

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("at least one input-output pair must be given")]
    NoInputFiles,

    #[error("odd number of file arguments received; must be given in pairs")]
    OddInputFiles,

    #[error("input-output pairs cannot be given as arguments when reading them from stdin")]
    StdinWithArgs,

    #[error("path read from stdin is not valid UTF-8: {0}")]
    InvalidPath(#[source] Utf8Error),

    #[error("failed to read input-output pairs from stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("encountered errors during processing; failing")]
    EncounteredErrors,
}

/// Builds an evaluator for the given search paths, on the evaluate thread.
pub type EvaluatorFactory = fn(&[PathBuf]) -> Box<dyn Evaluator>;

/// The evaluator selected at build time.
#[cfg(feature = "jsonnet")]
pub fn default_evaluator(jpaths: &[PathBuf]) -> Box<dyn Evaluator> {
    Box::new(jty_jsonnet::JsonnetEvaluator::new(jpaths))
}

/// The evaluator selected at build time.
#[cfg(not(feature = "jsonnet"))]
pub fn default_evaluator(_jpaths: &[PathBuf]) -> Box<dyn Evaluator> {
    Box::new(jty_core::JsonStreamEvaluator::new())
}

/// A CLI environment: standard streams, a filesystem and an evaluator.
pub struct Command {
    pub stdin: Box<dyn BufRead>,
    pub stdout: SharedWriter,
    pub stderr: SharedWriter,
    pub fs: Arc<dyn FileSystem>,
    pub evaluator: EvaluatorFactory,
}

impl Command {
    /// Process every pair named by `flags`.
    ///
    /// Per-file failures are written to stderr as they happen and collapse
    /// into [`RunError::EncounteredErrors`] once all work has drained.
    pub fn run(&mut self, flags: &Flags) -> Result<(), RunError> {
        if flags.from_stdin {
            if !flags.args.is_empty() {
                return Err(RunError::StdinWithArgs);
            }
        } else {
            if flags.args.is_empty() {
                return Err(RunError::NoInputFiles);
            }
            if flags.args.len() % 2 != 0 {
                return Err(RunError::OddInputFiles);
            }
        }

        let mut builder = Pipeline::builder(flags.workers());
        if flags.dry_run {
            builder = builder.dry_run(self.stdout.clone());
        }
        let diagnostics = Arc::new(Diagnostics::new(self.stderr.clone()));
        let make_evaluator = self.evaluator;
        let jpaths = flags.jpaths.clone();
        let pipeline = builder.spawn(
            Arc::clone(&self.fs),
            move || make_evaluator(&jpaths),
            diagnostics,
        )?;

        let fed = if flags.from_stdin {
            let delim = if flags.zero { b'\0' } else { b'\n' };
            submit_from_stream(&mut self.stdin, delim, &pipeline)
        } else {
            for pair in flags.args.chunks_exact(2) {
                pipeline.submit(&pair[0], &pair[1]);
            }
            Ok(())
        };

        // Whatever was submitted still runs to completion.
        let report = pipeline.close();
        fed?;

        if report.failed {
            return Err(RunError::EncounteredErrors);
        }
        Ok(())
    }
}

fn submit_from_stream<R: BufRead>(
    reader: R,
    delim: u8,
    pipeline: &Pipeline,
) -> Result<(), RunError> {
    let mut entries = Entries::new(reader, delim);
    let mut processed = false;

    while let Some(input) = entries.next_entry()? {
        let Some(output) = entries.next_entry()? else {
            return Err(RunError::OddInputFiles);
        };
        pipeline.submit(input, output);
        processed = true;
    }

    if !processed {
        return Err(RunError::NoInputFiles);
    }
    Ok(())
}

/// Delimiter-terminated path entries.
struct Entries<R> {
    reader: R,
    delim: u8,
    buf: Vec<u8>,
}

impl<R: BufRead> Entries<R> {
    fn new(reader: R, delim: u8) -> Self {
        Self {
            reader,
            delim,
            buf: Vec::new(),
        }
    }

    /// The next entry, or `None` at end of input.
    ///
    /// A trailing entry without its terminator is a pairing error.
    fn next_entry(&mut self) -> Result<Option<String>, RunError> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(self.delim, &mut self.buf)
            .map_err(RunError::Stdin)?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.pop() != Some(self.delim) {
            return Err(RunError::OddInputFiles);
        }
        if self.delim == b'\n' && self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }

        let entry = std::str::from_utf8(&self.buf).map_err(RunError::InvalidPath)?;
        Ok(Some(entry.to_owned()))
    }
}
