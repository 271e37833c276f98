//! jty: render templated documents to YAML, many files at a time.
//!
//! The [`Pipeline`] reads sources, evaluates them to JSON document streams
//! and writes each stream as framed YAML, overlapping disk I/O with a single
//! evaluator. Filesystem, evaluator and output format are pluggable.

mod diagnostics;
mod eval;
mod format;
mod fs;
mod pipeline;
mod sink;

pub use diagnostics::Diagnostics;
pub use eval::{EvalError, Evaluator, JsonStreamEvaluator, split_stream};
pub use format::{DocumentStream, OutputFormat, SerializeError, YamlFormat};
pub use fs::{FileSystem, MemoryFs, OsFs};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineError, PipelineReport, PipelineStats, StageError,
    WriteError,
};
pub use sink::{CaptureBuffer, SharedWriter};
