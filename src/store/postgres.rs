//! Postgres-backed store. Short-lived transactions for every write; run
//! completion is published with `pg_notify` inside the finalize
//! transaction and consumed through `LISTEN` with a 1 Hz poll fallback.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use url::Url;

use super::{
    validate_job_source, Bridge, Job, JobError, JobId, PipelineRun, PipelineSpec, PipelineStore,
    RunId, SpecId, StoreError, StoreResult, TaskRun,
};
use crate::task::TaskType;
use crate::value::Value;

const COMPLETION_CHANNEL: &str = "pipeline_run_completed";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_specs (
        id UUID PRIMARY KEY,
        source TEXT NOT NULL,
        max_task_duration_ms BIGINT,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        spec_id UUID NOT NULL REFERENCES pipeline_specs (id),
        bridge_names JSONB NOT NULL DEFAULT '[]',
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL,
        spec_id UUID NOT NULL REFERENCES pipeline_specs (id) ON DELETE CASCADE,
        meta JSONB NOT NULL,
        outputs JSONB,
        errors JSONB,
        created_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_task_runs (
        run_id UUID NOT NULL REFERENCES pipeline_runs (id) ON DELETE CASCADE,
        dot_id TEXT NOT NULL,
        task_type TEXT NOT NULL,
        output JSONB,
        error TEXT,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (run_id, dot_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bridges (
        name TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_errors (
        job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        description TEXT NOT NULL,
        occurrences BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (job_id, description)
    )
    "#,
];

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn duration_ms(duration: Option<Duration>) -> Option<i64> {
    duration.map(|d| d.as_millis() as i64)
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let bridge_names: JsonValue = row.try_get("bridge_names")?;
    Ok(Job {
        id: JobId(row.try_get("id")?),
        name: row.try_get("name")?,
        spec_id: SpecId(row.try_get("spec_id")?),
        bridge_names: serde_json::from_value(bridge_names)?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<PipelineRun> {
    let meta: JsonValue = row.try_get("meta")?;
    let raw_outputs: Option<JsonValue> = row.try_get("outputs")?;
    let raw_errors: Option<JsonValue> = row.try_get("errors")?;

    let errors: Option<Vec<Option<String>>> = match raw_errors {
        Some(json) => Some(serde_json::from_value(json)?),
        None => None,
    };
    // JSON arrays cannot hold SQL NULLs, so a JSON null slot is ambiguous
    // between "no output" and "output is the null value". The parity
    // invariant (an output slot is empty iff its error slot is set)
    // resolves it on the way back out.
    let outputs: Option<Vec<Option<Value>>> = match raw_outputs {
        Some(JsonValue::Array(items)) => {
            let empty = Vec::new();
            let errors = errors.as_ref().unwrap_or(&empty);
            Some(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        JsonValue::Null => {
                            let errored = errors.get(i).map(|e| e.is_some()).unwrap_or(false);
                            if errored {
                                None
                            } else {
                                Some(Value::Null)
                            }
                        }
                        other => Some(Value::from_json(other)),
                    })
                    .collect(),
            )
        }
        Some(_) | None => None,
    };

    Ok(PipelineRun {
        id: RunId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        spec_id: SpecId(row.try_get("spec_id")?),
        meta: Value::from_json(&meta),
        outputs,
        errors,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn task_run_from_row(row: &PgRow) -> StoreResult<TaskRun> {
    let task_type: String = row.try_get("task_type")?;
    let output: Option<JsonValue> = row.try_get("output")?;
    Ok(TaskRun {
        run_id: RunId(row.try_get("run_id")?),
        dot_id: row.try_get("dot_id")?,
        task_type: TaskType::parse(&task_type)
            .ok_or_else(|| StoreError::Message(format!("unknown task type \"{task_type}\"")))?,
        output: output.map(|json| Value::from_json(&json)),
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl PipelineStore for PostgresStore {
    async fn create_job(
        &self,
        name: &str,
        source: &str,
        max_task_duration: Option<Duration>,
    ) -> StoreResult<Job> {
        let bridge_names = validate_job_source(self, source).await?;

        let now = Utc::now();
        let spec_id = SpecId::new();
        let job_id = JobId::new();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO pipeline_specs (id, source, max_task_duration_ms, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(spec_id.0)
        .bind(source)
        .bind(duration_ms(max_task_duration))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO jobs (id, name, spec_id, bridge_names, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id.0)
        .bind(name)
        .bind(spec_id.0)
        .bind(serde_json::to_value(&bridge_names)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Job {
            id: job_id,
            name: name.to_string(),
            spec_id,
            bridge_names,
            created_at: now,
        })
    }

    async fn delete_job(&self, job_id: JobId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1 RETURNING spec_id")
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = deleted else {
            return Err(StoreError::JobNotFound(job_id));
        };
        let spec_id: uuid::Uuid = row.try_get("spec_id")?;

        let still_referenced: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM jobs WHERE spec_id = $1")
                .bind(spec_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get("count")?;
        if still_referenced == 0 {
            // Cascades to the spec's runs and their task runs.
            sqlx::query("DELETE FROM pipeline_specs WHERE id = $1")
                .bind(spec_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, name, spec_id, bridge_names, created_at FROM jobs WHERE id = $1",
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn load_spec(&self, spec_id: SpecId) -> StoreResult<PipelineSpec> {
        let row = sqlx::query(
            "SELECT id, source, max_task_duration_ms, created_at \
             FROM pipeline_specs WHERE id = $1",
        )
        .bind(spec_id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::SpecNotFound(spec_id))?;

        let max_task_duration_ms: Option<i64> = row.try_get("max_task_duration_ms")?;
        Ok(PipelineSpec {
            id: SpecId(row.try_get("id")?),
            source: row.try_get("source")?,
            max_task_duration: max_task_duration_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            created_at: row.try_get("created_at")?,
        })
    }

    async fn create_run(&self, job_id: JobId, meta: Value) -> StoreResult<PipelineRun> {
        let spec_row = sqlx::query("SELECT spec_id FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        let spec_id = SpecId(spec_row.try_get("spec_id")?);

        let run = PipelineRun {
            id: RunId::new(),
            job_id,
            spec_id,
            meta,
            outputs: None,
            errors: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        sqlx::query(
            "INSERT INTO pipeline_runs (id, job_id, spec_id, meta, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id.0)
        .bind(run.job_id.0)
        .bind(run.spec_id.0)
        .bind(run.meta.to_json())
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    async fn find_run(&self, run_id: RunId) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query(
            "SELECT id, job_id, spec_id, meta, outputs, errors, created_at, finished_at \
             FROM pipeline_runs WHERE id = $1",
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn insert_task_run(&self, task_run: &TaskRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pipeline_task_runs \
             (run_id, dot_id, task_type, output, error, started_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (run_id, dot_id) DO NOTHING",
        )
        .bind(task_run.run_id.0)
        .bind(&task_run.dot_id)
        .bind(task_run.task_type.as_str())
        .bind(task_run.output.as_ref().map(Value::to_json))
        .bind(&task_run.error)
        .bind(task_run.started_at)
        .bind(task_run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_runs(&self, run_id: RunId) -> StoreResult<Vec<TaskRun>> {
        let rows = sqlx::query(
            "SELECT run_id, dot_id, task_type, output, error, started_at, finished_at \
             FROM pipeline_task_runs WHERE run_id = $1 ORDER BY dot_id",
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_run_from_row).collect()
    }

    async fn finalize_run(
        &self,
        run_id: RunId,
        outputs: Vec<Option<Value>>,
        errors: Vec<Option<String>>,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE pipeline_runs SET outputs = $2, errors = $3, finished_at = $4 \
             WHERE id = $1 AND finished_at IS NULL",
        )
        .bind(run_id.0)
        .bind(serde_json::to_value(&outputs)?)
        .bind(serde_json::to_value(&errors)?)
        .bind(finished_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM pipeline_runs WHERE id = $1) AS present")
                .bind(run_id.0)
                .fetch_one(&mut *tx)
                .await?
                .try_get("present")?;
            if !exists {
                return Err(StoreError::RunNotFound(run_id));
            }
            // Already finalized: the notification went out with the first
            // write, nothing left to do.
            return Ok(());
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(COMPLETION_CHANNEL)
            .bind(run_id.0.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn await_run(&self, run_id: RunId) -> StoreResult<()> {
        // Listen before the first completeness check so a finalize racing
        // with this call cannot be missed; the 1 Hz re-check also covers
        // runs deleted while waiting.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(COMPLETION_CHANNEL).await?;

        loop {
            let row = sqlx::query("SELECT finished_at FROM pipeline_runs WHERE id = $1")
                .bind(run_id.0)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                None => return Err(StoreError::RunNotFound(run_id)),
                Some(row) => {
                    let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;
                    if finished_at.is_some() {
                        return Ok(());
                    }
                }
            }

            match tokio::time::timeout(Duration::from_secs(1), listener.recv()).await {
                Ok(Ok(notification)) => {
                    if notification.payload() != run_id.0.to_string() {
                        continue;
                    }
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {} // poll fallback
            }
        }
    }

    async fn upsert_bridge(&self, bridge: &Bridge) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bridges (name, url, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET url = EXCLUDED.url",
        )
        .bind(&bridge.name)
        .bind(bridge.url.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_bridge(&self, name: &str) -> StoreResult<Bridge> {
        let row = sqlx::query("SELECT name, url FROM bridges WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::BridgeNotFound(name.to_string()))?;
        let raw_url: String = row.try_get("url")?;
        Ok(Bridge {
            name: row.try_get("name")?,
            url: Url::parse(&raw_url)
                .map_err(|err| StoreError::Message(format!("stored bridge URL is invalid: {err}")))?,
        })
    }

    async fn delete_bridge(&self, name: &str) -> StoreResult<()> {
        let referencing = self.find_job_ids_with_bridge(name).await?;
        if !referencing.is_empty() {
            return Err(StoreError::BridgeInUse {
                name: name.to_string(),
                jobs: referencing.len(),
            });
        }
        let deleted = sqlx::query("DELETE FROM bridges WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::BridgeNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn find_job_ids_with_bridge(&self, name: &str) -> StoreResult<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE bridge_names @> jsonb_build_array($1::text) ORDER BY id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(JobId(row.try_get("id")?)))
            .collect()
    }

    async fn record_job_error(&self, job_id: JobId, description: &str) -> StoreResult<()> {
        let exists: bool = sqlx::query("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1) AS present")
            .bind(job_id.0)
            .fetch_one(&self.pool)
            .await?
            .try_get("present")?;
        if !exists {
            return Ok(());
        }
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO job_errors (job_id, description, occurrences, created_at, updated_at) \
             VALUES ($1, $2, 1, $3, $3) \
             ON CONFLICT (job_id, description) DO UPDATE SET \
             occurrences = job_errors.occurrences + 1, updated_at = EXCLUDED.updated_at",
        )
        .bind(job_id.0)
        .bind(description)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_errors(&self, job_id: JobId) -> StoreResult<Vec<JobError>> {
        let rows = sqlx::query(
            "SELECT job_id, description, occurrences, created_at, updated_at \
             FROM job_errors WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(JobError {
                    job_id: JobId(row.try_get("job_id")?),
                    description: row.try_get("description")?,
                    occurrences: row.try_get("occurrences")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}
