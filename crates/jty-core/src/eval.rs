//! Evaluator interface for the evaluate stage.

use serde_json::Value;

/// Turns template source text into a stream of JSON documents.
///
/// The pipeline owns exactly one evaluator and calls it from a single
/// thread, so implementations need not be `Send` or `Sync`.
pub trait Evaluator {
    /// Evaluate `source` and return its documents, in order, as JSON text.
    ///
    /// `name` identifies the source in error messages and is the base for
    /// resolving relative imports.
    fn evaluate_stream(&mut self, name: &str, source: &str) -> Result<Vec<String>, EvalError>;
}

impl<E: Evaluator + ?Sized> Evaluator for Box<E> {
    fn evaluate_stream(&mut self, name: &str, source: &str) -> Result<Vec<String>, EvalError> {
        (**self).evaluate_stream(name, source)
    }
}

/// Errors that can occur during evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("{0}")]
    Failed(String),

    #[error("stream mode: top-level object was {0}, not an array")]
    NotAStream(&'static str),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Split an evaluated top-level value into its stream documents.
///
/// The value must be an array; each element becomes one document.
pub fn split_stream(value: Value) -> Result<Vec<String>, EvalError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| serde_json::to_string(item).map_err(EvalError::from))
            .collect(),
        other => Err(EvalError::NotAStream(kind_name(&other))),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "a null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Evaluator for plain JSON sources.
///
/// The source must be a JSON array; each element is one document. No
/// templating is performed.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStreamEvaluator;

impl JsonStreamEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for JsonStreamEvaluator {
    fn evaluate_stream(&mut self, _name: &str, source: &str) -> Result<Vec<String>, EvalError> {
        let value: Value = serde_json::from_str(source)?;
        split_stream(value)
    }
}
