//! Pipeline run scheduler: creates runs, executes DAGs with dependency
//! ordering and composed deadlines, persists every task result, and wakes
//! callers awaiting completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dag::Pipeline;
use crate::result::{RunResult, RunnerError, TaskError, TaskResult};
use crate::store::{JobId, PipelineRun, PipelineStore, RunId, StoreError, TaskRun};
use crate::task::{Task, TaskContext, TaskRegistry};
use crate::value::Value;

/// Executes pipeline runs against a [`PipelineStore`].
///
/// Cheap to clone; all clones share the same shutdown token and in-flight
/// run tracker, so [`Runner::close`] drains work spawned through any of
/// them.
#[derive(Clone)]
pub struct Runner {
    store: Arc<dyn PipelineStore>,
    config: Arc<Config>,
    registry: Arc<TaskRegistry>,
    client: reqwest::Client,
    shutdown: CancellationToken,
    runs: TaskTracker,
    started: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(store: Arc<dyn PipelineStore>, config: Config) -> Self {
        Self::with_registry(store, config, TaskRegistry::standard())
    }

    pub fn with_registry(
        store: Arc<dyn PipelineStore>,
        config: Config,
        registry: TaskRegistry,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            registry: Arc::new(registry),
            client: reqwest::Client::new(),
            shutdown: CancellationToken::new(),
            runs: TaskTracker::new(),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("pipeline runner started");
        }
    }

    /// Cancel all in-flight runs, wait for their workers to drain, then
    /// return. Cancelled tasks persist a `context canceled` result and
    /// their runs still finalize.
    pub async fn close(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.runs.close();
        self.runs.wait().await;
        info!("pipeline runner closed");
    }

    /// Persist a new run for the job's spec and schedule it. Returns as
    /// soon as the run row exists; execution proceeds in the background.
    pub async fn create_run(&self, job_id: JobId, meta: Value) -> Result<RunId, RunnerError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(RunnerError::NotStarted);
        }
        let run = self
            .store
            .create_run(job_id, meta)
            .await
            .map_err(|err| match err {
                StoreError::JobNotFound(id) => RunnerError::NoSuchJob(id),
                other => RunnerError::Store(other),
            })?;
        let run_id = run.id;
        debug!(run_id = %run_id, job_id = %job_id, "pipeline run created");

        let runner = self.clone();
        self.runs.spawn(async move {
            if let Err(err) = runner.execute_run(run).await {
                error!(run_id = %run_id, error = %err, "pipeline run execution failed");
            }
        });
        Ok(run_id)
    }

    /// Resolve when the run's `finished_at` is set. Dropping the returned
    /// future abandons the wait without affecting the run.
    pub async fn await_run(&self, run_id: RunId) -> Result<(), RunnerError> {
        match self.store.await_run(run_id).await {
            Ok(()) => Ok(()),
            Err(StoreError::RunNotFound(_)) => Err(RunnerError::RunNotFound(run_id)),
            Err(other) => Err(other.into()),
        }
    }

    /// Leaf results in leaf-dot-id order. Only meaningful after
    /// [`Runner::await_run`] returned success.
    pub async fn results_for_run(&self, run_id: RunId) -> Result<Vec<RunResult>, RunnerError> {
        let run = self
            .store
            .find_run(run_id)
            .await?
            .ok_or(RunnerError::RunNotFound(run_id))?;
        match (run.outputs, run.errors) {
            (Some(outputs), Some(errors)) => Ok(outputs
                .into_iter()
                .zip(errors)
                .map(|(value, error)| RunResult { value, error })
                .collect()),
            _ => Err(RunnerError::RunNotFinished(run_id)),
        }
    }

    /// Ready-queue execution: per-node pending parent counters feed a
    /// [`JoinSet`]; a completing node decrements its children and spawns
    /// any that reach zero. A node's inputs are its parents' results in
    /// declared edge order.
    async fn execute_run(&self, run: PipelineRun) -> Result<(), RunnerError> {
        let spec = self.store.load_spec(run.spec_id).await?;
        let pipeline = Pipeline::parse(&spec.source)?;
        let tasks: Vec<Arc<dyn Task>> = pipeline
            .nodes()
            .iter()
            .map(|node| self.registry.build(node).map(Arc::from))
            .collect::<Result<_, _>>()?;

        let ctx = Arc::new(TaskContext {
            meta: run.meta.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            client: self.client.clone(),
        });
        let max_task_duration = spec
            .max_task_duration
            .unwrap_or(self.config.job_pipeline_max_task_duration);

        let node_count = pipeline.len();
        let mut pending: Vec<usize> = (0..node_count)
            .map(|index| pipeline.parents_of(index).len())
            .collect();
        let mut results: Vec<Option<TaskResult>> = vec![None; node_count];
        let mut workers: JoinSet<(usize, TaskResult)> = JoinSet::new();

        for index in 0..node_count {
            if pending[index] == 0 {
                self.spawn_task(
                    &mut workers,
                    &pipeline,
                    &tasks,
                    &results,
                    index,
                    max_task_duration,
                    &ctx,
                    run.id,
                );
            }
        }

        while let Some(joined) = workers.join_next().await {
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    // Task bodies only fail through their result; a join
                    // error means a panic. The affected slot stays empty
                    // and is backfilled below so the run still finalizes.
                    error!(run_id = %run.id, error = %err, "task worker panicked");
                    continue;
                }
            };
            results[index] = Some(result);

            for &child in pipeline.children_of(index) {
                pending[child] -= 1;
                if pending[child] == 0 {
                    self.spawn_task(
                        &mut workers,
                        &pipeline,
                        &tasks,
                        &results,
                        child,
                        max_task_duration,
                        &ctx,
                        run.id,
                    );
                }
            }
        }

        let leaves = pipeline.leaves();
        let mut outputs = Vec::with_capacity(leaves.len());
        let mut errors = Vec::with_capacity(leaves.len());
        for &leaf in &leaves {
            let result = results[leaf]
                .clone()
                .unwrap_or_else(|| TaskResult::err(TaskError::Cancelled));
            outputs.push(result.value);
            errors.push(result.error.map(|error| error.to_string()));
        }

        self.store
            .finalize_run(run.id, outputs, errors, Utc::now())
            .await?;
        info!(run_id = %run.id, "pipeline run finished");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_task(
        &self,
        workers: &mut JoinSet<(usize, TaskResult)>,
        pipeline: &Pipeline,
        tasks: &[Arc<dyn Task>],
        results: &[Option<TaskResult>],
        index: usize,
        max_task_duration: Duration,
        ctx: &Arc<TaskContext>,
        run_id: RunId,
    ) {
        let inputs: Vec<TaskResult> = pipeline
            .parents_of(index)
            .iter()
            .map(|&parent| {
                results[parent]
                    .clone()
                    .expect("parent result present by dependency order")
            })
            .collect();
        let node = pipeline.node(index).clone();
        let deadline = node
            .timeout
            .map_or(max_task_duration, |timeout| timeout.min(max_task_duration));
        let task = tasks[index].clone();
        let ctx = ctx.clone();
        let store = self.store.clone();
        let shutdown = self.shutdown.clone();

        workers.spawn(async move {
            let started_at = Utc::now();
            debug!(run_id = %run_id, task = %node.dot_id, "task started");

            let result = tokio::select! {
                _ = shutdown.cancelled() => TaskResult::err(TaskError::Cancelled),
                outcome = tokio::time::timeout(deadline, task.run(&ctx, &inputs)) => {
                    match outcome {
                        Ok(result) => result,
                        Err(_) => TaskResult::err(TaskError::Timeout),
                    }
                }
            };
            let finished_at = Utc::now();

            if let Some(error) = &result.error {
                debug!(run_id = %run_id, task = %node.dot_id, error = %error, "task errored");
            }

            let task_run = TaskRun {
                run_id,
                dot_id: node.dot_id.clone(),
                task_type: node.task_type,
                output: result.value.clone(),
                error: result.error.as_ref().map(ToString::to_string),
                started_at,
                finished_at,
            };
            if let Err(err) = store.insert_task_run(&task_run).await {
                warn!(
                    run_id = %run_id,
                    task = %node.dot_id,
                    error = %err,
                    "failed to persist task run"
                );
            }

            (index, result)
        });
    }
}
