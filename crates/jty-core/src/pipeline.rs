//! Pipeline: the staged read → evaluate → write worker pool.
//!
//! ```text
//!            submit (cap N)        rendezvous (cap 0)       write (cap N)
//! submit() ─────────────▶ N readers ─────────▶ 1 evaluator ─────────▶ N writers
//! ```
//!
//! Reads and writes are pure I/O and run on `N` threads each. Evaluation
//! runs on exactly one thread that owns the evaluator; the zero-capacity
//! handoff into it throttles the readers so fast reads cannot pile up source
//! text in memory.
//!
//! Every stage reports its own failures to [`Diagnostics`] and drops the
//! failed request. Nothing crosses a stage boundary except successful work.

use crate::diagnostics::Diagnostics;
use crate::eval::{EvalError, Evaluator};
use crate::format::{OutputFormat, SerializeError, YamlFormat};
use crate::fs::FileSystem;
use crate::sink::SharedWriter;
use crossbeam_channel::{Receiver, Sender, bounded};
use serde_json::Value;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Marker written before the first document of every output stream.
const STREAM_START: &[u8] = b"---\n";
/// Marker written after the last document of every output stream.
const STREAM_END: &[u8] = b"...\n";

/// A request to render the source at `input` and save it at `output`.
struct ProcessRequest {
    input: String,
    output: String,
}

/// Source text read from `input`, waiting for evaluation.
struct EvalRequest {
    input: String,
    output: String,
    source: String,
}

/// Evaluated JSON documents waiting to be written to `output`.
struct WriteRequest {
    output: String,
    documents: Vec<String>,
}

/// A failure of a single request in one stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to evaluate jsonnet at {path}: {source}")]
    Evaluate { path: String, source: EvalError },

    #[error("failed to write output file {path}: {source}")]
    Write { path: String, source: WriteError },
}

/// Errors from the write stage.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("{0}")]
    Create(#[source] io::Error),

    #[error("error unmarshaling JSON object {index} when writing {path}: {source}")]
    Decode {
        index: usize,
        path: String,
        source: serde_json::Error,
    },

    #[error("error writing first document separator when writing {path}: {source}")]
    StreamStart { path: String, source: io::Error },

    #[error("error encoding {format} document {index} when writing {path}: {source}")]
    Encode {
        format: String,
        index: usize,
        path: String,
        source: SerializeError,
    },

    #[error("error closing {format} encoder when writing {path}: {source}")]
    Close {
        format: String,
        path: String,
        source: SerializeError,
    },

    #[error("error writing {format} stream terminator when writing {path}: {source}")]
    StreamEnd {
        format: String,
        path: String,
        source: io::Error,
    },
}

/// Errors that can occur while starting a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to spawn {stage} worker: {source}")]
    Spawn {
        stage: &'static str,
        source: io::Error,
    },
}

/// Counters gathered while the pipeline runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Requests accepted by [`Pipeline::submit`].
    pub submitted: usize,
    /// Requests reported by dry run instead of processed.
    pub dry_run: usize,
    /// Sources read successfully.
    pub read: usize,
    /// Sources evaluated successfully.
    pub evaluated: usize,
    /// Output files written completely.
    pub written: usize,
    /// Requests dropped because of an error.
    pub failed: usize,
}

/// Outcome of a drained pipeline.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Whether any error was reported to the pipeline's diagnostics.
    pub failed: bool,
    /// Per-stage counters.
    pub stats: PipelineStats,
    /// Time from spawn to the end of the drain.
    pub duration: Duration,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        !self.failed
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    dry_run: AtomicUsize,
    read: AtomicUsize,
    evaluated: AtomicUsize,
    written: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dry_run: self.dry_run.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            evaluated: self.evaluated.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every worker.
struct Shared {
    fs: Arc<dyn FileSystem>,
    format: Arc<dyn OutputFormat>,
    diagnostics: Arc<Diagnostics>,
    dry_run: Option<SharedWriter>,
    counters: Counters,
}

impl Shared {
    fn fail(&self, err: StageError) {
        Counters::bump(&self.counters.failed);
        self.diagnostics.report(&err);
    }
}

/// Configures and starts a [`Pipeline`].
pub struct PipelineBuilder {
    workers: usize,
    format: Arc<dyn OutputFormat>,
    dry_run: Option<SharedWriter>,
}

impl PipelineBuilder {
    /// Switch to dry-run mode: every request is reported to `sink` instead
    /// of being read, evaluated and written.
    pub fn dry_run(mut self, sink: SharedWriter) -> Self {
        self.dry_run = Some(sink);
        self
    }

    /// Set the output format. Defaults to [`YamlFormat`].
    pub fn format(mut self, format: impl OutputFormat + 'static) -> Self {
        self.format = Arc::new(format);
        self
    }

    /// Start all workers.
    ///
    /// `make_evaluator` runs on the evaluate thread, so the evaluator itself
    /// never crosses threads.
    pub fn spawn<F, E>(
        self,
        fs: Arc<dyn FileSystem>,
        make_evaluator: F,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Pipeline, PipelineError>
    where
        F: FnOnce() -> E + Send + 'static,
        E: Evaluator + 'static,
    {
        let shared = Arc::new(Shared {
            fs,
            format: self.format,
            diagnostics,
            dry_run: self.dry_run,
            counters: Counters::default(),
        });

        let (submit_tx, submit_rx) = bounded(self.workers);
        let mut pipeline = Pipeline {
            submit: Some(submit_tx),
            readers: Vec::with_capacity(self.workers),
            evaluator: None,
            writers: Vec::with_capacity(self.workers),
            shared,
            started: Instant::now(),
        };

        match pipeline.start_workers(self.workers, submit_rx, make_evaluator) {
            Ok(()) => Ok(pipeline),
            Err(err) => {
                // Drains whatever did start.
                drop(pipeline);
                Err(err)
            }
        }
    }
}

/// Concurrent processor of input/output path pairs.
///
/// Requests are accepted with [`submit`](Pipeline::submit) until
/// [`close`](Pipeline::close), which drains every stage in order. Dropping an
/// unclosed pipeline drains it the same way.
pub struct Pipeline {
    submit: Option<Sender<ProcessRequest>>,
    readers: Vec<JoinHandle<()>>,
    evaluator: Option<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    started: Instant,
}

impl Pipeline {
    /// Start configuring a pipeline with `workers` read workers and
    /// `workers` write workers.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn builder(workers: usize) -> PipelineBuilder {
        assert!(workers >= 1, "pipeline needs at least one I/O worker");
        PipelineBuilder {
            workers,
            format: Arc::new(YamlFormat),
            dry_run: None,
        }
    }

    /// Start a YAML pipeline with default settings.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new<F, E>(
        workers: usize,
        fs: Arc<dyn FileSystem>,
        make_evaluator: F,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self, PipelineError>
    where
        F: FnOnce() -> E + Send + 'static,
        E: Evaluator + 'static,
    {
        Self::builder(workers).spawn(fs, make_evaluator, diagnostics)
    }

    /// Queue the source at `input` to be rendered to `output`.
    ///
    /// Blocks while the submit queue is full.
    ///
    /// # Panics
    ///
    /// Panics if every read worker has already exited, which only happens
    /// when a worker panicked.
    pub fn submit(&self, input: impl Into<String>, output: impl Into<String>) {
        let req = ProcessRequest {
            input: input.into(),
            output: output.into(),
        };
        let Some(submit) = &self.submit else {
            unreachable!("submit queue is only closed by close or drop");
        };
        if submit.send(req).is_err() {
            panic!("pipeline read workers exited before close");
        }
        Counters::bump(&self.shared.counters.submitted);
    }

    /// Counters as of now. Stages keep moving while this is read.
    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    /// Stop accepting requests and wait for all queued work to finish.
    ///
    /// A panic in any worker is resumed here once every stage has stopped.
    pub fn close(mut self) -> PipelineReport {
        if let Err(payload) = self.shutdown() {
            std::panic::resume_unwind(payload);
        }

        let report = PipelineReport {
            failed: self.shared.diagnostics.has_failed(),
            stats: self.shared.counters.snapshot(),
            duration: self.started.elapsed(),
        };
        tracing::info!(
            submitted = report.stats.submitted,
            written = report.stats.written,
            failed = report.stats.failed,
            dry_run = report.stats.dry_run,
            elapsed = ?report.duration,
            "pipeline drained"
        );
        report
    }

    fn start_workers<F, E>(
        &mut self,
        workers: usize,
        submit_rx: Receiver<ProcessRequest>,
        make_evaluator: F,
    ) -> Result<(), PipelineError>
    where
        F: FnOnce() -> E + Send + 'static,
        E: Evaluator + 'static,
    {
        let (eval_tx, eval_rx) = bounded::<EvalRequest>(0);
        let (write_tx, write_rx) = bounded::<WriteRequest>(workers);

        for i in 0..workers {
            let shared = Arc::clone(&self.shared);
            let requests = write_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("jty-write-{i}"))
                .spawn(move || write_worker(&shared, requests))
                .map_err(|source| PipelineError::Spawn {
                    stage: "write",
                    source,
                })?;
            self.writers.push(handle);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("jty-eval".into())
            .spawn(move || {
                // Nothing reaches this stage in a dry run.
                if shared.dry_run.is_some() {
                    return;
                }
                let evaluator = make_evaluator();
                evaluate_worker(&shared, evaluator, eval_rx, write_tx)
            })
            .map_err(|source| PipelineError::Spawn {
                stage: "evaluate",
                source,
            })?;
        self.evaluator = Some(handle);

        for i in 0..workers {
            let shared = Arc::clone(&self.shared);
            let requests = submit_rx.clone();
            let evaluate = eval_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("jty-read-{i}"))
                .spawn(move || read_worker(&shared, requests, evaluate))
                .map_err(|source| PipelineError::Spawn {
                    stage: "read",
                    source,
                })?;
            self.readers.push(handle);
        }

        Ok(())
    }

    /// Close the queues in dependency order, joining each stage before the
    /// next one can observe its queue closing.
    fn shutdown(&mut self) -> thread::Result<()> {
        let mut result = Ok(());

        // Readers exit once the submit queue is closed and empty. Their
        // senders into the evaluate queue go with them.
        drop(self.submit.take());
        join_all(self.readers.drain(..), &mut result);

        // The evaluator owns the only sender into the write queue.
        join_all(self.evaluator.take(), &mut result);

        join_all(self.writers.drain(..), &mut result);
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("open", &self.submit.is_some())
            .field("readers", &self.readers.len())
            .field("writers", &self.writers.len())
            .field("dry_run", &self.shared.dry_run.is_some())
            .field("stats", &self.shared.counters.snapshot())
            .finish()
    }
}

fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>, result: &mut thread::Result<()>) {
    for handle in handles {
        if let Err(payload) = handle.join() {
            if result.is_ok() {
                *result = Err(payload);
            }
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

fn read_worker(shared: &Shared, requests: Receiver<ProcessRequest>, evaluate: Sender<EvalRequest>) {
    for req in requests {
        if let Some(sink) = &shared.dry_run {
            let written = sink.write_line(format_args!(
                "would process {} and save {} output to {}",
                req.input,
                shared.format.name(),
                req.output
            ));
            if let Err(err) = written {
                tracing::warn!(error = %err, "failed to write dry-run message");
            }
            Counters::bump(&shared.counters.dry_run);
            continue;
        }

        let source = match shared
            .fs
            .read(Path::new(&req.input))
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }) {
            Ok(source) => source,
            Err(source) => {
                shared.fail(StageError::Read {
                    path: req.input,
                    source,
                });
                continue;
            }
        };
        Counters::bump(&shared.counters.read);
        tracing::debug!(input = %req.input, bytes = source.len(), "read source");

        let req = EvalRequest {
            input: req.input,
            output: req.output,
            source,
        };
        if evaluate.send(req).is_err() {
            // The evaluator is gone; close() will surface its panic.
            break;
        }
    }
}

fn evaluate_worker<E: Evaluator>(
    shared: &Shared,
    mut evaluator: E,
    requests: Receiver<EvalRequest>,
    write: Sender<WriteRequest>,
) {
    for req in requests {
        let documents = match evaluator.evaluate_stream(&req.input, &req.source) {
            Ok(documents) => documents,
            Err(source) => {
                shared.fail(StageError::Evaluate {
                    path: req.input,
                    source,
                });
                continue;
            }
        };
        Counters::bump(&shared.counters.evaluated);
        tracing::debug!(input = %req.input, documents = documents.len(), "evaluated");

        let req = WriteRequest {
            output: req.output,
            documents,
        };
        if write.send(req).is_err() {
            break;
        }
    }
}

fn write_worker(shared: &Shared, requests: Receiver<WriteRequest>) {
    for req in requests {
        match write_output(shared.fs.as_ref(), shared.format.as_ref(), &req) {
            Ok(()) => {
                Counters::bump(&shared.counters.written);
                tracing::debug!(output = %req.output, "wrote output");
            }
            Err(source) => shared.fail(StageError::Write {
                path: req.output,
                source,
            }),
        }
    }
}

/// Write one framed document stream to `req.output`.
///
/// Every document is decoded before anything is written, so a bad document
/// leaves the output empty rather than partial.
fn write_output(
    fs: &dyn FileSystem,
    format: &dyn OutputFormat,
    req: &WriteRequest,
) -> Result<(), WriteError> {
    let path = &req.output;
    // Unbuffered, so an I/O error surfaces at the step that caused it.
    let mut out = fs.create(Path::new(path)).map_err(WriteError::Create)?;

    let values = req
        .documents
        .iter()
        .enumerate()
        .map(|(index, doc)| {
            serde_json::from_str::<Value>(doc).map_err(|source| WriteError::Decode {
                index,
                path: path.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if !values.is_empty() {
        out.write_all(STREAM_START)
            .map_err(|source| WriteError::StreamStart {
                path: path.clone(),
                source,
            })?;
    }

    let mut stream = format.begin(&mut *out);
    for (index, value) in values.iter().enumerate() {
        stream
            .write_document(value)
            .map_err(|source| WriteError::Encode {
                format: format.name().to_owned(),
                index,
                path: path.clone(),
                source,
            })?;
    }
    stream.close().map_err(|source| WriteError::Close {
        format: format.name().to_owned(),
        path: path.clone(),
        source,
    })?;

    // The document stream does not terminate itself.
    out.write_all(STREAM_END)
        .and_then(|()| out.flush())
        .map_err(|source| WriteError::StreamEnd {
            format: format.name().to_owned(),
            path: path.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::JsonStreamEvaluator;
    use crate::format::DocumentStream;
    use crate::fs::MemoryFs;
    use crate::sink::CaptureBuffer;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ONE_TWO: &str = r#"[{"one": 1}, {"one": 1, "two": 2}]"#;
    const ONE_TWO_YAML: &str = "---\none: 1\n---\none: 1\ntwo: 2\n...\n";

    struct Harness {
        fs: MemoryFs,
        log: CaptureBuffer,
        diagnostics: Arc<Diagnostics>,
    }

    impl Harness {
        fn new() -> Self {
            let log = CaptureBuffer::new();
            Self {
                fs: MemoryFs::new(),
                diagnostics: Arc::new(Diagnostics::new(log.clone())),
                log,
            }
        }

        fn pipeline(&self, workers: usize) -> Pipeline {
            Pipeline::new(
                workers,
                Arc::new(self.fs.clone()),
                JsonStreamEvaluator::new,
                Arc::clone(&self.diagnostics),
            )
            .unwrap()
        }
    }

    /// Evaluator that returns fixed documents regardless of the source.
    struct FixedEvaluator(Vec<&'static str>);

    impl Evaluator for FixedEvaluator {
        fn evaluate_stream(&mut self, _: &str, _: &str) -> Result<Vec<String>, EvalError> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    #[test]
    fn test_process_writes_framed_yaml() {
        let h = Harness::new();
        h.fs.write("in1.json", ONE_TWO);

        let p = h.pipeline(4);
        // Directory yml wasn't created up front.
        p.submit("in1.json", "yml/out1.yml");
        let report = p.close();

        assert!(report.succeeded());
        assert_eq!(h.fs.get_string("yml/out1.yml").as_deref(), Some(ONE_TWO_YAML));
        assert!(h.log.is_empty());
        assert_eq!(report.stats.submitted, 1);
        assert_eq!(report.stats.written, 1);
        assert_eq!(report.stats.failed, 0);
    }

    #[test]
    fn test_zero_documents_only_terminator() {
        let h = Harness::new();
        h.fs.write("empty.json", "[]");

        let p = h.pipeline(1);
        p.submit("empty.json", "empty.yml");
        assert!(p.close().succeeded());

        assert_eq!(h.fs.get_string("empty.yml").as_deref(), Some("...\n"));
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        struct NeverEvaluator;
        impl Evaluator for NeverEvaluator {
            fn evaluate_stream(&mut self, name: &str, _: &str) -> Result<Vec<String>, EvalError> {
                panic!("dry run evaluated {name}");
            }
        }

        let h = Harness::new();
        let out = CaptureBuffer::new();
        let p = Pipeline::builder(2)
            .dry_run(out.writer())
            .spawn(
                Arc::new(h.fs.clone()),
                || -> NeverEvaluator { panic!("dry run built an evaluator") },
                Arc::clone(&h.diagnostics),
            )
            .unwrap();

        p.submit("in1.jsonnet", "out1.yml");
        p.submit("in2.jsonnet", "out2.yml");
        let report = p.close();

        assert!(report.succeeded());
        assert_eq!(report.stats.dry_run, 2);
        assert!(h.log.is_empty());
        assert!(h.fs.is_empty());

        let out = out.contents();
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("would process in1.jsonnet and save YAML output to out1.yml\n"));
        assert!(out.contains("would process in2.jsonnet and save YAML output to out2.yml\n"));
    }

    #[test]
    fn test_read_failure_is_isolated() {
        let h = Harness::new();
        h.fs.write("in2.json", ONE_TWO);

        let p = h.pipeline(2);
        p.submit("in1.json", "out1.yml");
        p.submit("in2.json", "out2.yml");
        let report = p.close();

        assert!(report.failed);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.written, 1);
        assert!(!h.fs.exists("out1.yml"));
        assert_eq!(h.fs.get_string("out2.yml").as_deref(), Some(ONE_TWO_YAML));

        let log = h.log.contents();
        assert!(log.starts_with("failed to read in1.json: "), "log: {log:?}");
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn test_every_failure_logged_once() {
        let h = Harness::new();
        let p = h.pipeline(4);
        for i in 0..50 {
            p.submit(format!("{i}.json"), format!("{i}.yml"));
        }
        let report = p.close();

        assert!(report.failed);
        assert_eq!(report.stats.failed, 50);
        assert_eq!(h.diagnostics.reported(), 50);
        let log = h.log.contents();
        assert_eq!(log.lines().count(), 50);
        assert!(log.lines().all(|l| l.starts_with("failed to read ")));
        assert!(h.fs.is_empty());
    }

    #[test]
    fn test_evaluation_failure() {
        let h = Harness::new();
        h.fs.write("bad.json", "[1,");
        h.fs.write("good.json", "[1]");

        let p = h.pipeline(2);
        p.submit("bad.json", "bad.yml");
        p.submit("good.json", "good.yml");
        let report = p.close();

        assert!(report.failed);
        assert!(!h.fs.exists("bad.yml"));
        assert_eq!(h.fs.get_string("good.yml").as_deref(), Some("---\n1\n...\n"));
        assert!(
            h.log
                .contents()
                .starts_with("failed to evaluate jsonnet at bad.json: ")
        );
    }

    #[test]
    fn test_decode_failure_writes_nothing() {
        let h = Harness::new();
        h.fs.write("in.json", "ignored");

        let p = Pipeline::new(
            1,
            Arc::new(h.fs.clone()),
            || FixedEvaluator(vec![r#"{"a": 1}"#, "not json"]),
            Arc::clone(&h.diagnostics),
        )
        .unwrap();
        p.submit("in.json", "out.yml");
        assert!(p.close().failed);

        assert_eq!(h.fs.get_string("out.yml").as_deref(), Some(""));
        let log = h.log.contents();
        assert!(
            log.starts_with(
                "failed to write output file out.yml: \
                 error unmarshaling JSON object 1 when writing out.yml: "
            ),
            "log: {log:?}"
        );
    }

    #[test]
    fn test_create_failure() {
        struct ReadOnlyFs(MemoryFs);
        impl FileSystem for ReadOnlyFs {
            fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
                self.0.read(path)
            }
            fn create(&self, _: &Path) -> io::Result<Box<dyn Write + Send>> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
            }
        }

        let h = Harness::new();
        h.fs.write("in.json", ONE_TWO);
        let p = Pipeline::new(
            1,
            Arc::new(ReadOnlyFs(h.fs.clone())),
            JsonStreamEvaluator::new,
            Arc::clone(&h.diagnostics),
        )
        .unwrap();
        p.submit("in.json", "out.yml");
        assert!(p.close().failed);

        assert_eq!(
            h.log.contents(),
            "failed to write output file out.yml: read-only\n"
        );
    }

    #[test]
    fn test_document_order_within_file() {
        let h = Harness::new();
        for i in 0..40 {
            h.fs.write(format!("in{i}.json"), format!("[{i}, \"{i}-b\", [{i}]]"));
        }

        let p = h.pipeline(3);
        for i in 0..40 {
            p.submit(format!("in{i}.json"), format!("out/{i}.yml"));
        }
        let report = p.close();

        assert!(report.succeeded());
        assert_eq!(report.stats.written, 40);
        for i in 0..40 {
            let got = h.fs.get_string(format!("out/{i}.yml")).unwrap();
            assert_eq!(got, format!("---\n{i}\n---\n{i}-b\n---\n- {i}\n...\n"));
        }
    }

    #[test]
    fn test_evaluator_stays_on_one_thread() {
        // Rc makes the evaluator !Send; it must be built on the evaluate thread.
        struct ThreadEvaluator {
            seen: Rc<RefCell<Vec<String>>>,
            log: Arc<parking_lot::Mutex<Vec<String>>>,
        }
        impl Evaluator for ThreadEvaluator {
            fn evaluate_stream(&mut self, name: &str, source: &str) -> Result<Vec<String>, EvalError> {
                let thread = thread::current().name().unwrap_or_default().to_owned();
                self.seen.borrow_mut().push(name.to_owned());
                self.log.lock().push(thread);
                JsonStreamEvaluator.evaluate_stream(name, source)
            }
        }

        let h = Harness::new();
        for i in 0..10 {
            h.fs.write(format!("{i}.json"), "[true]");
        }
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let factory_log = Arc::clone(&log);

        let p = Pipeline::new(
            4,
            Arc::new(h.fs.clone()),
            move || ThreadEvaluator {
                seen: Rc::default(),
                log: factory_log,
            },
            Arc::clone(&h.diagnostics),
        )
        .unwrap();
        for i in 0..10 {
            p.submit(format!("{i}.json"), format!("{i}.yml"));
        }
        assert!(p.close().succeeded());

        let threads = log.lock();
        assert_eq!(threads.len(), 10);
        assert!(threads.iter().all(|t| t == "jty-eval"));
    }

    #[test]
    fn test_drop_drains_queued_work() {
        let h = Harness::new();
        for i in 0..5 {
            h.fs.write(format!("{i}.json"), ONE_TWO);
        }
        {
            let p = h.pipeline(2);
            for i in 0..5 {
                p.submit(format!("{i}.json"), format!("{i}.yml"));
            }
        }
        for i in 0..5 {
            assert_eq!(
                h.fs.get_string(format!("{i}.yml")).as_deref(),
                Some(ONE_TWO_YAML)
            );
        }
    }

    #[test]
    fn test_invalid_utf8_source() {
        let h = Harness::new();
        h.fs.write("in.json", vec![0xff, 0xfe]);

        let p = h.pipeline(1);
        p.submit("in.json", "out.yml");
        assert!(p.close().failed);
        assert!(h.log.contents().starts_with("failed to read in.json: "));
    }

    #[test]
    #[should_panic(expected = "at least one I/O worker")]
    fn test_zero_workers_panics() {
        let _ = Pipeline::builder(0);
    }

    #[test]
    #[should_panic]
    fn test_evaluator_panic_resumes_on_close() {
        struct Boom;
        impl Evaluator for Boom {
            fn evaluate_stream(&mut self, _: &str, _: &str) -> Result<Vec<String>, EvalError> {
                panic!("boom");
            }
        }

        let h = Harness::new();
        h.fs.write("in.json", "[]");
        let p = Pipeline::new(
            1,
            Arc::new(h.fs.clone()),
            || Boom,
            Arc::clone(&h.diagnostics),
        )
        .unwrap();
        p.submit("in.json", "out.yml");
        p.close();
    }

    /// Passes everything through to memory, except that writes to `bad`
    /// fail once `allow` bytes have been accepted.
    struct FailingFs {
        inner: MemoryFs,
        bad: &'static str,
        allow: usize,
    }

    impl FileSystem for FailingFs {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.inner.read(path)
        }

        fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
            if path == Path::new(self.bad) {
                return Ok(Box::new(FailingWriter { allow: self.allow }));
            }
            self.inner.create(path)
        }
    }

    struct FailingWriter {
        allow: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.allow == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.allow);
            self.allow -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_failing_write(allow: usize) -> (Harness, PipelineReport) {
        let h = Harness::new();
        h.fs.write("bad.json", ONE_TWO);
        h.fs.write("good.json", ONE_TWO);
        let fs = FailingFs {
            inner: h.fs.clone(),
            bad: "bad.yml",
            allow,
        };

        let p = Pipeline::new(
            2,
            Arc::new(fs),
            JsonStreamEvaluator::new,
            Arc::clone(&h.diagnostics),
        )
        .unwrap();
        p.submit("bad.json", "bad.yml");
        p.submit("good.json", "good.yml");
        let report = p.close();
        (h, report)
    }

    #[test]
    fn test_stream_start_write_failure() {
        let (h, report) = run_failing_write(0);

        assert!(report.failed);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.written, 1);
        assert_eq!(
            h.log.contents(),
            "failed to write output file bad.yml: \
             error writing first document separator when writing bad.yml: disk full\n"
        );
        assert_eq!(h.fs.get_string("good.yml").as_deref(), Some(ONE_TWO_YAML));
    }

    #[test]
    fn test_document_write_failure() {
        // The leading marker fits; the first document does not.
        let (h, report) = run_failing_write(STREAM_START.len());

        assert!(report.failed);
        assert_eq!(report.stats.written, 1);
        assert_eq!(
            h.log.contents(),
            "failed to write output file bad.yml: \
             error encoding YAML document 0 when writing bad.yml: disk full\n"
        );
        assert_eq!(h.fs.get_string("good.yml").as_deref(), Some(ONE_TWO_YAML));
    }

    #[test]
    fn test_stream_end_write_failure() {
        let allow = ONE_TWO_YAML.len() - STREAM_END.len();
        let (h, report) = run_failing_write(allow);

        assert!(report.failed);
        assert_eq!(
            h.log.contents(),
            "failed to write output file bad.yml: \
             error writing YAML stream terminator when writing bad.yml: disk full\n"
        );
    }

    #[test]
    fn test_evaluate_handoff_throttles_readers() {
        const WORKERS: usize = 2;

        struct GatedEvaluator {
            entered: Sender<()>,
            gate: Receiver<()>,
        }
        impl Evaluator for GatedEvaluator {
            fn evaluate_stream(&mut self, name: &str, source: &str) -> Result<Vec<String>, EvalError> {
                let _ = self.entered.send(());
                // Blocks until the gate sender is dropped.
                let _ = self.gate.recv();
                JsonStreamEvaluator.evaluate_stream(name, source)
            }
        }

        let h = Harness::new();
        for i in 0..20 {
            h.fs.write(format!("{i}.json"), "[1]");
        }
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = bounded::<()>(0);

        let p = Pipeline::new(
            WORKERS,
            Arc::new(h.fs.clone()),
            move || GatedEvaluator {
                entered: entered_tx,
                gate: gate_rx,
            },
            Arc::clone(&h.diagnostics),
        )
        .unwrap();

        let stalled = thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20 {
                    p.submit(format!("{i}.json"), format!("{i}.yml"));
                }
            });
            entered_rx.recv().unwrap();
            thread::sleep(Duration::from_millis(100));
            let stats = p.stats();
            drop(gate_tx);
            stats
        });

        // One request in the evaluator, one held by each blocked reader,
        // and at most `WORKERS` waiting in the submit queue.
        assert_eq!(stalled.evaluated, 0, "{stalled:?}");
        assert!(stalled.read <= WORKERS + 1, "{stalled:?}");
        assert!(stalled.submitted <= 2 * WORKERS + 1, "{stalled:?}");

        let report = p.close();
        assert!(report.succeeded());
        assert_eq!(report.stats.written, 20);
        for i in 0..20 {
            assert_eq!(
                h.fs.get_string(format!("{i}.yml")).as_deref(),
                Some("---\n1\n...\n")
            );
        }
    }

    /// One compact JSON document per line.
    struct JsonLines;

    struct JsonLinesStream<'w> {
        out: &'w mut dyn Write,
    }

    impl OutputFormat for JsonLines {
        fn name(&self) -> &str {
            "JSON lines"
        }

        fn begin<'w>(&self, out: &'w mut dyn Write) -> Box<dyn DocumentStream + 'w> {
            Box::new(JsonLinesStream { out })
        }
    }

    impl DocumentStream for JsonLinesStream<'_> {
        fn write_document(&mut self, value: &Value) -> Result<(), SerializeError> {
            writeln!(self.out, "{value}")?;
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<(), SerializeError> {
            Ok(())
        }
    }

    #[test]
    fn test_custom_format() {
        let h = Harness::new();
        h.fs.write("in.json", ONE_TWO);

        let p = Pipeline::builder(1)
            .format(JsonLines)
            .spawn(
                Arc::new(h.fs.clone()),
                JsonStreamEvaluator::new,
                Arc::clone(&h.diagnostics),
            )
            .unwrap();
        p.submit("in.json", "out.jsonl");
        assert!(p.close().succeeded());

        assert_eq!(
            h.fs.get_string("out.jsonl").as_deref(),
            Some("---\n{\"one\":1}\n{\"one\":1,\"two\":2}\n...\n")
        );
    }

    #[test]
    fn test_custom_format_dry_run_names_format() {
        let h = Harness::new();
        let out = CaptureBuffer::new();
        let p = Pipeline::builder(1)
            .format(JsonLines)
            .dry_run(out.writer())
            .spawn(
                Arc::new(h.fs.clone()),
                JsonStreamEvaluator::new,
                Arc::clone(&h.diagnostics),
            )
            .unwrap();
        p.submit("in.json", "out.jsonl");
        assert!(p.close().succeeded());

        assert_eq!(
            out.contents(),
            "would process in.json and save JSON lines output to out.jsonl\n"
        );
    }
}
