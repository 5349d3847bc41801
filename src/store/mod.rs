//! Persistence layer: durable records of pipeline specs, jobs, runs and
//! task runs, the bridge registry, and the run-completion notifier.
//!
//! The runner only ever talks to [`PipelineStore`]; the in-memory store
//! backs tests and embedded use, the Postgres store backs deployments.

pub mod memory;
pub mod postgres;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::dag::{ParseError, Pipeline};
use crate::task::TaskType;
use crate::value::Value;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a pipeline spec
    SpecId
);
id_type!(
    /// Unique identifier for a job referencing a spec
    JobId
);
id_type!(
    /// Unique identifier for one execution of a spec
    RunId
);

/// Immutable record of one pipeline definition. Created at job creation,
/// destroyed when the last referencing job is deleted.
#[derive(Clone, Debug)]
pub struct PipelineSpec {
    pub id: SpecId,
    pub source: String,
    pub max_task_duration: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

/// A job owning (or sharing) a pipeline spec.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub spec_id: SpecId,
    /// Bridge names referenced by the spec, captured at creation time so
    /// the "cannot delete a bridge in use" rule is a plain lookup.
    pub bridge_names: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One execution of a spec. `outputs`/`errors` are parallel arrays with
/// one slot per pipeline leaf, populated atomically at finalization.
#[derive(Clone, Debug)]
pub struct PipelineRun {
    pub id: RunId,
    pub job_id: JobId,
    pub spec_id: SpecId,
    pub meta: Value,
    pub outputs: Option<Vec<Option<Value>>>,
    pub errors: Option<Vec<Option<String>>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Append-only record of one task's execution within a run. Written once
/// on task termination, never updated.
#[derive(Clone, Debug)]
pub struct TaskRun {
    pub run_id: RunId,
    pub dot_id: String,
    pub task_type: TaskType,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A named external HTTP endpoint referenced by bridge tasks.
#[derive(Clone, Debug, PartialEq)]
pub struct Bridge {
    pub name: String,
    pub url: Url,
}

/// Job-level error outside the pipeline, deduplicated by description with
/// an occurrence counter.
#[derive(Clone, Debug, PartialEq)]
pub struct JobError {
    pub job_id: JobId,
    pub description: String,
    pub occurrences: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("pipeline spec not found: {0}")]
    SpecNotFound(SpecId),
    #[error("pipeline run not found: {0}")]
    RunNotFound(RunId),
    #[error("bridge not found: {0}")]
    BridgeNotFound(String),
    #[error("cannot delete bridge \"{name}\": {jobs} job(s) still reference it")]
    BridgeInUse { name: String, jobs: usize },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Narrow persistence interface the runner executes against.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Validate the pipeline source (including bridge references) and
    /// persist the spec together with a job row referencing it.
    async fn create_job(
        &self,
        name: &str,
        source: &str,
        max_task_duration: Option<Duration>,
    ) -> StoreResult<Job>;

    /// Delete a job, its spec when no other job references it (cascading
    /// to that spec's runs and task runs), and the job's recorded errors.
    async fn delete_job(&self, job_id: JobId) -> StoreResult<()>;

    async fn find_job(&self, job_id: JobId) -> StoreResult<Option<Job>>;

    async fn load_spec(&self, spec_id: SpecId) -> StoreResult<PipelineSpec>;

    /// Persist a new run for the job's spec. Fails with
    /// [`StoreError::JobNotFound`] when the job has been deleted.
    async fn create_run(&self, job_id: JobId, meta: Value) -> StoreResult<PipelineRun>;

    async fn find_run(&self, run_id: RunId) -> StoreResult<Option<PipelineRun>>;

    /// Idempotent on `(run_id, dot_id)`: the first write wins.
    async fn insert_task_run(&self, task_run: &TaskRun) -> StoreResult<()>;

    async fn task_runs(&self, run_id: RunId) -> StoreResult<Vec<TaskRun>>;

    /// Single atomic write of the final leaf results and `finished_at`,
    /// which also publishes the completion notification.
    async fn finalize_run(
        &self,
        run_id: RunId,
        outputs: Vec<Option<Value>>,
        errors: Vec<Option<String>>,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Resolve once the run is finalized. Implementations subscribe to the
    /// completion channel before the first completeness check so a finalize
    /// racing with the subscription cannot be missed. Fails with
    /// [`StoreError::RunNotFound`] when the run does not exist or is
    /// deleted while waiting.
    async fn await_run(&self, run_id: RunId) -> StoreResult<()>;

    async fn upsert_bridge(&self, bridge: &Bridge) -> StoreResult<()>;

    async fn find_bridge(&self, name: &str) -> StoreResult<Bridge>;

    /// Refused with [`StoreError::BridgeInUse`] while any job references
    /// the bridge.
    async fn delete_bridge(&self, name: &str) -> StoreResult<()>;

    async fn find_job_ids_with_bridge(&self, name: &str) -> StoreResult<Vec<JobId>>;

    /// Record a job-level error; an identical description increments the
    /// occurrence counter instead of inserting a new row. No-op once the
    /// job is gone.
    async fn record_job_error(&self, job_id: JobId, description: &str) -> StoreResult<()>;

    async fn job_errors(&self, job_id: JobId) -> StoreResult<Vec<JobError>>;
}

/// Bridge names referenced by a parsed pipeline, deduplicated. Fails when
/// a bridge node is missing its `name` option.
pub(crate) fn referenced_bridge_names(pipeline: &Pipeline) -> Result<Vec<String>, ParseError> {
    let mut names = BTreeSet::new();
    for node in pipeline.nodes() {
        if node.task_type == TaskType::Bridge {
            let name = node.options.get("name").filter(|name| !name.is_empty()).ok_or(
                ParseError::InvalidOption {
                    dot_id: node.dot_id.clone(),
                    key: "name",
                    message: "bridge tasks require a name".to_string(),
                },
            )?;
            names.insert(name.clone());
        }
    }
    Ok(names.into_iter().collect())
}

/// Shared `create_job` validation: parse the source and verify that every
/// referenced bridge exists.
pub(crate) async fn validate_job_source<S: PipelineStore + ?Sized>(
    store: &S,
    source: &str,
) -> StoreResult<Vec<String>> {
    let pipeline = Pipeline::parse(source)?;
    let names = referenced_bridge_names(&pipeline)?;
    for name in &names {
        store.find_bridge(name).await?;
    }
    Ok(names)
}
