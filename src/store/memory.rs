//! In-memory store used by tests and embedded runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::{
    validate_job_source, Bridge, Job, JobError, JobId, PipelineRun, PipelineSpec, PipelineStore,
    RunId, SpecId, StoreError, StoreResult, TaskRun,
};
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq)]
enum RunPhase {
    Running,
    Finished,
    Deleted,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    specs: HashMap<SpecId, PipelineSpec>,
    runs: HashMap<RunId, PipelineRun>,
    task_runs: HashMap<RunId, BTreeMap<String, TaskRun>>,
    bridges: BTreeMap<String, Bridge>,
    job_errors: HashMap<JobId, Vec<JobError>>,
}

/// Store that keeps every table behind one mutex and signals run
/// completion through per-run watch channels.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    completions: Arc<Mutex<HashMap<RunId, watch::Sender<RunPhase>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, run_id: RunId, phase: RunPhase) {
        let completions = self.completions.lock().expect("completions poisoned");
        if let Some(tx) = completions.get(&run_id) {
            let _ = tx.send(phase);
        }
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create_job(
        &self,
        name: &str,
        source: &str,
        max_task_duration: Option<Duration>,
    ) -> StoreResult<Job> {
        let bridge_names = validate_job_source(self, source).await?;

        let now = Utc::now();
        let spec = PipelineSpec {
            id: SpecId::new(),
            source: source.to_string(),
            max_task_duration,
            created_at: now,
        };
        let job = Job {
            id: JobId::new(),
            name: name.to_string(),
            spec_id: spec.id,
            bridge_names,
            created_at: now,
        };

        let mut tables = self.tables.lock().expect("tables poisoned");
        tables.specs.insert(spec.id, spec);
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete_job(&self, job_id: JobId) -> StoreResult<()> {
        let deleted_runs = {
            let mut tables = self.tables.lock().expect("tables poisoned");
            let job = tables
                .jobs
                .remove(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            tables.job_errors.remove(&job_id);

            let spec_still_referenced = tables
                .jobs
                .values()
                .any(|other| other.spec_id == job.spec_id);
            if spec_still_referenced {
                Vec::new()
            } else {
                tables.specs.remove(&job.spec_id);
                let run_ids: Vec<RunId> = tables
                    .runs
                    .values()
                    .filter(|run| run.spec_id == job.spec_id)
                    .map(|run| run.id)
                    .collect();
                for run_id in &run_ids {
                    tables.runs.remove(run_id);
                    tables.task_runs.remove(run_id);
                }
                run_ids
            }
        };

        for run_id in deleted_runs {
            self.signal(run_id, RunPhase::Deleted);
            self.completions
                .lock()
                .expect("completions poisoned")
                .remove(&run_id);
        }
        Ok(())
    }

    async fn find_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        let tables = self.tables.lock().expect("tables poisoned");
        Ok(tables.jobs.get(&job_id).cloned())
    }

    async fn load_spec(&self, spec_id: SpecId) -> StoreResult<PipelineSpec> {
        let tables = self.tables.lock().expect("tables poisoned");
        tables
            .specs
            .get(&spec_id)
            .cloned()
            .ok_or(StoreError::SpecNotFound(spec_id))
    }

    async fn create_run(&self, job_id: JobId, meta: Value) -> StoreResult<PipelineRun> {
        let run = {
            let mut tables = self.tables.lock().expect("tables poisoned");
            let job = tables
                .jobs
                .get(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            let run = PipelineRun {
                id: RunId::new(),
                job_id,
                spec_id: job.spec_id,
                meta,
                outputs: None,
                errors: None,
                created_at: Utc::now(),
                finished_at: None,
            };
            tables.runs.insert(run.id, run.clone());
            run
        };

        let (tx, _rx) = watch::channel(RunPhase::Running);
        self.completions
            .lock()
            .expect("completions poisoned")
            .insert(run.id, tx);
        Ok(run)
    }

    async fn find_run(&self, run_id: RunId) -> StoreResult<Option<PipelineRun>> {
        let tables = self.tables.lock().expect("tables poisoned");
        Ok(tables.runs.get(&run_id).cloned())
    }

    async fn insert_task_run(&self, task_run: &TaskRun) -> StoreResult<()> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        tables
            .task_runs
            .entry(task_run.run_id)
            .or_default()
            .entry(task_run.dot_id.clone())
            .or_insert_with(|| task_run.clone());
        Ok(())
    }

    async fn task_runs(&self, run_id: RunId) -> StoreResult<Vec<TaskRun>> {
        let tables = self.tables.lock().expect("tables poisoned");
        Ok(tables
            .task_runs
            .get(&run_id)
            .map(|runs| runs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn finalize_run(
        &self,
        run_id: RunId,
        outputs: Vec<Option<Value>>,
        errors: Vec<Option<String>>,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        {
            let mut tables = self.tables.lock().expect("tables poisoned");
            let run = tables
                .runs
                .get_mut(&run_id)
                .ok_or(StoreError::RunNotFound(run_id))?;
            run.outputs = Some(outputs);
            run.errors = Some(errors);
            run.finished_at = Some(finished_at);
        }
        self.signal(run_id, RunPhase::Finished);
        Ok(())
    }

    async fn await_run(&self, run_id: RunId) -> StoreResult<()> {
        // Subscribe before the first phase check: a finalize racing with
        // this call lands in the channel, not in a lost wakeup.
        let mut rx = {
            let completions = self.completions.lock().expect("completions poisoned");
            match completions.get(&run_id) {
                Some(tx) => tx.subscribe(),
                None => return Err(StoreError::RunNotFound(run_id)),
            }
        };

        loop {
            match *rx.borrow_and_update() {
                RunPhase::Finished => return Ok(()),
                RunPhase::Deleted => return Err(StoreError::RunNotFound(run_id)),
                RunPhase::Running => {}
            }
            if rx.changed().await.is_err() {
                return Err(StoreError::RunNotFound(run_id));
            }
        }
    }

    async fn upsert_bridge(&self, bridge: &Bridge) -> StoreResult<()> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        tables.bridges.insert(bridge.name.clone(), bridge.clone());
        Ok(())
    }

    async fn find_bridge(&self, name: &str) -> StoreResult<Bridge> {
        let tables = self.tables.lock().expect("tables poisoned");
        tables
            .bridges
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::BridgeNotFound(name.to_string()))
    }

    async fn delete_bridge(&self, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        let referencing = tables
            .jobs
            .values()
            .filter(|job| job.bridge_names.iter().any(|n| n == name))
            .count();
        if referencing > 0 {
            return Err(StoreError::BridgeInUse {
                name: name.to_string(),
                jobs: referencing,
            });
        }
        tables
            .bridges
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::BridgeNotFound(name.to_string()))
    }

    async fn find_job_ids_with_bridge(&self, name: &str) -> StoreResult<Vec<JobId>> {
        let tables = self.tables.lock().expect("tables poisoned");
        let mut ids: Vec<JobId> = tables
            .jobs
            .values()
            .filter(|job| job.bridge_names.iter().any(|n| n == name))
            .map(|job| job.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn record_job_error(&self, job_id: JobId, description: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        if !tables.jobs.contains_key(&job_id) {
            // A job deleted between the failure and the report is not an
            // error worth surfacing.
            return Ok(());
        }
        let now = Utc::now();
        let errors = tables.job_errors.entry(job_id).or_default();
        match errors.iter_mut().find(|e| e.description == description) {
            Some(existing) => {
                existing.occurrences += 1;
                existing.updated_at = now;
            }
            None => errors.push(JobError {
                job_id,
                description: description.to_string(),
                occurrences: 1,
                created_at: now,
                updated_at: now,
            }),
        }
        Ok(())
    }

    async fn job_errors(&self, job_id: JobId) -> StoreResult<Vec<JobError>> {
        let tables = self.tables.lock().expect("tables poisoned");
        Ok(tables.job_errors.get(&job_id).cloned().unwrap_or_default())
    }
}
