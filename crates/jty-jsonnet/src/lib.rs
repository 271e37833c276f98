//! Jsonnet evaluator backend for jty.
//!
//! Wraps a `jrsonnet` evaluation state with the standard library loaded and a
//! file import resolver. Imports are always resolved on the real disk,
//! whatever filesystem the pipeline reads sources from.

use jrsonnet_evaluator::{EvaluationState, FileImportResolver};
use jty_core::{EvalError, Evaluator};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Evaluates Jsonnet sources in stream mode: the top-level value must be an
/// array, and each element becomes one output document.
///
/// The evaluation state is reference-counted and not thread-safe; build one
/// per thread (the pipeline builds it on its evaluate thread).
pub struct JsonnetEvaluator {
    state: EvaluationState,
}

impl JsonnetEvaluator {
    /// Create an evaluator with the given import search paths.
    ///
    /// `search_paths` is ordered from lowest to highest priority: when two
    /// directories provide the same import, the later one wins.
    pub fn new(search_paths: &[PathBuf]) -> Self {
        let state = EvaluationState::default();
        state.with_stdlib();
        state.set_import_resolver(Box::new(FileImportResolver {
            library_paths: resolver_order(search_paths),
        }));
        tracing::debug!(?search_paths, "created jsonnet evaluator");
        Self { state }
    }
}

impl Default for JsonnetEvaluator {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Evaluator for JsonnetEvaluator {
    fn evaluate_stream(&mut self, name: &str, source: &str) -> Result<Vec<String>, EvalError> {
        let state = &self.state;
        state
            .run_in_state(|| {
                let val = state.evaluate_snippet_raw(Rc::from(Path::new(name)), source.into())?;
                state.manifest_stream(val)
            })
            .map(|docs| docs.iter().map(|doc| doc.to_string()).collect())
            .map_err(|e| EvalError::Failed(state.stringify_err(&e)))
    }
}

/// The resolver tries library paths front to back and stops at the first
/// match, so the highest-priority path must come first.
fn resolver_order(search_paths: &[PathBuf]) -> Vec<PathBuf> {
    search_paths.iter().rev().cloned().collect()
}
