//! Task results and the error taxonomy surfaced to operators.
//!
//! Every task emits exactly one [`TaskResult`] with either a value or an
//! error populated, never both. Errors are data: they are persisted on the
//! task run, propagated to dependents, and returned in the run's final
//! results without ever aborting the pipeline.

use crate::store::{JobId, RunId};
use crate::value::Value;

/// Outcome of a single task execution.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub value: Option<Value>,
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn ok(value: Value) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: TaskError) -> Self {
        Self {
            value: None,
            error: Some(error),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Final per-leaf outcome of a completed run, as read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub value: Option<Value>,
    pub error: Option<String>,
}

/// Failure of one task. All variants are non-fatal to the runner.
///
/// Several wordings are observable (asserted by operators and tests) and
/// must not drift: the decimal coercion message, the JSON path message,
/// and the context timeout/cancel strings.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum TaskError {
    #[error("{task} requires exactly {want} inputs (got {got}): wrong number of task inputs")]
    WrongInputCardinality {
        task: &'static str,
        want: usize,
        got: usize,
    },

    #[error("bad input for task: {0}")]
    BadInput(String),

    #[error("got unsuccessful response status {status}")]
    BadResponse { status: u16 },

    #[error("refused to fetch {0}: disallowed IP or hostname")]
    InsecureUrl(String),

    #[error("HTTP response too large, must be less than {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("no bridge exists with name \"{0}\"")]
    NoSuchBridge(String),

    #[error("bridge lookup failed: {0}")]
    BridgeLookup(String),

    #[error("context deadline exceeded")]
    Timeout,

    #[error("context canceled")]
    Cancelled,

    /// `path` is pre-rendered as a JSON array so the message matches the
    /// wire format exactly: `could not resolve path ["USD"] in {...}`.
    #[error("could not resolve path {path} in {raw}")]
    PathNotFound { path: String, raw: String },

    #[error("{0}")]
    Conversion(String),

    #[error("{0}")]
    Http(String),
}

/// Run-level failures returned by the runner's public operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no job found with id {0} (most likely it was deleted)")]
    NoSuchJob(JobId),

    #[error("run not found - could not determine if run is finished (run ID: {0})")]
    RunNotFound(RunId),

    #[error("run {0} has not finished")]
    RunNotFinished(RunId),

    #[error("pipeline source is invalid: {0}")]
    Parse(#[from] crate::dag::ParseError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error("runner is not started")]
    NotStarted,
}
