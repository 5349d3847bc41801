//! Sluice - a pipeline runtime for oracle data jobs
//!
//! A job's observation source is a DAG of typed tasks that fetch, parse,
//! combine and transform off-chain data. This crate provides:
//!
//! ## Execution
//!
//! - [`Runner`]: creates runs, schedules DAGs with dependency ordering and
//!   composed timeouts, and returns the leaf results
//! - [`task`]: the task contract plus the production task set
//!   (HTTP, JSON parse, multiply, median, bridge)
//!
//! ## Pipeline model
//!
//! - [`dag`]: arena-based DAG with cached topological order and a parser
//!   for the dot-syntax pipeline source
//! - [`value`]: the untyped value model shared by all tasks
//!
//! ## Persistence
//!
//! - [`store`]: durable specs, jobs, runs and task runs behind a narrow
//!   interface, with in-memory and Postgres implementations
//! - [`config`]: environment-based configuration

pub mod config;
pub mod dag;
pub mod logging;
pub mod result;
pub mod runner;
pub mod store;
pub mod task;
pub mod value;

// Configuration
pub use config::Config;
pub use logging::init_logging;

// Pipeline model
pub use dag::{DagError, ParseError, Pipeline, TaskNode};
pub use value::Value;

// Task contract
pub use result::{RunResult, RunnerError, TaskError, TaskResult};
pub use task::{
    BridgeTask, HttpMethod, HttpTask, JsonParseTask, MedianTask, MultiplyTask, Task, TaskContext,
    TaskRegistry, TaskType,
};

// Persistence
pub use store::{
    Bridge, Job, JobError, JobId, MemoryStore, PipelineRun, PipelineSpec, PipelineStore,
    PostgresStore, RunId, SpecId, StoreError, TaskRun,
};

// Runner
pub use runner::Runner;
