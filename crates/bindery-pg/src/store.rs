//! PostgresJobStore - JobStore on PostgreSQL (sqlx)
//!
//! - claim の競合は `FOR UPDATE ... SKIP LOCKED` で解決する（1 statement）
//! - worker 側の書き込みは `id` + `worker_id` + `status` を WHERE に含めた条件付き UPDATE
//! - timestamps come from the database clock (`now()`), so every worker
//!   agrees on ordering.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use bindery_core::app::QueueCounts;
use bindery_core::domain::{
    Artifacts, Job, JobEvent, JobFilter, JobId, JobStatus, NewEvent, NewJob, StoreError, WorkerId,
};
use bindery_core::ports::{IdGenerator, JobStore, RetryDecision, SystemClock, UlidGenerator};

use crate::rows::{EVENT_COLUMNS, JOB_COLUMNS, event_from_row, job_from_row};

const MIGRATION: &str = include_str!("../migrations/0001_jobs.sql");

/// Postgres error codes we translate.
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

pub struct PostgresJobStore {
    pool: PgPool,
    ids: UlidGenerator<SystemClock>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ids: UlidGenerator::new(SystemClock),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options: PgConnectOptions = database_url
            .parse()
            .map_err(|e| map_sqlx_error("parse database url", e))?;
        Self::connect_with(options, 10).await
    }

    pub async fn connect_with(options: PgConnectOptions, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes (idempotent).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        tracing::info!("job store schema ready");
        Ok(())
    }

    async fn insert_one(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
    ) -> Result<Job, StoreError> {
        let id = job.id.unwrap_or_else(|| self.ids.generate_job_id());
        let depends_on: Vec<String> = job.depends_on.iter().map(ToString::to_string).collect();
        let max_attempts = to_i32("max_attempts", job.max_attempts)?;

        let sql = format!(
            "INSERT INTO jobs (id, book_id, chapter, section, step, priority, depends_on, \
             input_artifacts, max_attempts, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, clock_timestamp(), clock_timestamp()) \
             RETURNING {JOB_COLUMNS}"
        );
        // now() は transaction 開始時刻なので、batch 内の挿入順は clock_timestamp() で残す
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(&job.book_id)
            .bind(&job.chapter)
            .bind(&job.section)
            .bind(job.step.as_str())
            .bind(job.priority)
            .bind(&depends_on)
            .bind(Json(&job.input_artifacts))
            .bind(max_attempts)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| match db_code(&e).as_deref() {
                Some(UNIQUE_VIOLATION) => StoreError::AlreadyExists(id),
                _ => map_sqlx_error("insert job", e),
            })?;
        job_from_row(&row)
    }

    async fn insert_event<'e, E>(&self, executor: E, event: &NewEvent) -> Result<JobEvent, StoreError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let job_id = event.job_id;
        let sql = format!(
            "INSERT INTO job_events (id, job_id, book_id, event_type, progress, message, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {EVENT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(self.ids.generate_event_id().to_string())
            .bind(job_id.to_string())
            .bind(&event.book_id)
            .bind(event.event_type.as_str())
            .bind(event.progress.map(i16::from))
            .bind(&event.message)
            .bind(Json(&event.metadata))
            .fetch_one(executor)
            .await
            .map_err(|e| match db_code(&e).as_deref() {
                Some(FOREIGN_KEY_VIOLATION) => StoreError::NotFound(job_id),
                _ => map_sqlx_error("append event", e),
            })?;
        event_from_row(&row)
    }

    /// Conditional single-row update owned by `worker`; `true` if it applied.
    async fn owned_update(
        &self,
        operation: &str,
        sql: &str,
        id: JobId,
        worker: &WorkerId,
        artifacts: Option<&Artifacts>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut query = sqlx::query(sql).bind(id.to_string()).bind(worker.as_str());
        if let Some(artifacts) = artifacts {
            query = query.bind(Json(artifacts));
        }
        if let Some(error) = error {
            query = query.bind(error);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let applied = result.rows_affected() == 1;
        if !applied {
            tracing::debug!(job_id = %id, worker_id = %worker, operation, "conditional update did not apply");
        }
        Ok(applied)
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1) AS found")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job exists", e))?;
        row.try_get("found")
            .map_err(|e| StoreError::Decode(format!("found: {e}")))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.insert_jobs(vec![job]).await?;
        jobs.pop()
            .ok_or_else(|| StoreError::Backend("batch insert returned no job".to_string()))
    }

    async fn insert_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError> {
        for job in &jobs {
            job.validate()?;
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin insert", e))?;
        let mut inserted = Vec::with_capacity(jobs.len());
        for job in jobs {
            inserted.push(self.insert_one(&mut tx, job).await?);
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit insert", e))?;
        tracing::debug!(count = inserted.len(), "jobs inserted");
        Ok(inserted)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::text IS NULL OR book_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::text IS NULL OR step = $3) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $4"
        );
        let limit = filter.limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows = sqlx::query(&sql)
            .bind(filter.book_id.as_deref())
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.step.as_ref().map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, StoreError> {
        // dependency with no row: d.status IS NULL, which is distinct from 'done'
        let sql = format!(
            "UPDATE jobs AS j \
             SET status = 'claimed', worker_id = $1, attempts = j.attempts + 1, \
                 started_at = now(), updated_at = now(), error = NULL \
             FROM ( \
                 SELECT c.id FROM jobs AS c \
                 WHERE c.status = 'pending' \
                   AND c.attempts < c.max_attempts \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM unnest(c.depends_on) AS dep(id) \
                       LEFT JOIN jobs AS d ON d.id = dep.id \
                       WHERE d.status IS DISTINCT FROM 'done' \
                   ) \
                 ORDER BY c.priority DESC, c.created_at ASC, c.id ASC \
                 LIMIT 1 \
                 FOR UPDATE OF c SKIP LOCKED \
             ) AS next \
             WHERE j.id = next.id \
             RETURNING {}",
            qualified_job_columns("j")
        );
        let row = sqlx::query(&sql)
            .bind(worker.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim next", e))?;
        let job = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &job {
            tracing::debug!(job_id = %job.id, worker_id = %worker, attempt = job.attempts, "claimed");
        }
        Ok(job)
    }

    async fn reclaim(&self, id: JobId, worker: &WorkerId) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE jobs SET status = 'claimed', worker_id = $2, started_at = now(), \
                 updated_at = now(), error = NULL \
             WHERE id = $1 AND status = 'pending' AND worker_id IS NULL \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(worker.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_running(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.owned_update(
            "mark running",
            "UPDATE jobs SET status = 'running', updated_at = now() \
             WHERE id = $1 AND worker_id = $2 AND status IN ('claimed', 'running')",
            id,
            worker,
            None,
            None,
        )
        .await
    }

    async fn touch(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.owned_update(
            "touch",
            "UPDATE jobs SET updated_at = now() \
             WHERE id = $1 AND worker_id = $2 AND status IN ('claimed', 'running')",
            id,
            worker,
            None,
            None,
        )
        .await
    }

    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        outputs: Artifacts,
    ) -> Result<bool, StoreError> {
        self.owned_update(
            "complete",
            "UPDATE jobs SET status = 'done', output_artifacts = $3, error = NULL, \
                 completed_at = now(), updated_at = now() \
             WHERE id = $1 AND worker_id = $2 AND status = 'running'",
            id,
            worker,
            Some(&outputs),
            None,
        )
        .await
    }

    async fn fail(&self, id: JobId, worker: &WorkerId, error: &str) -> Result<bool, StoreError> {
        self.owned_update(
            "fail",
            "UPDATE jobs SET status = 'failed', error = $3, \
                 completed_at = now(), updated_at = now() \
             WHERE id = $1 AND worker_id = $2 AND status = 'running'",
            id,
            worker,
            None,
            Some(error),
        )
        .await
    }

    async fn requeue(
        &self,
        id: JobId,
        worker: &WorkerId,
        inputs: Artifacts,
    ) -> Result<bool, StoreError> {
        self.owned_update(
            "requeue",
            "UPDATE jobs SET status = 'pending', input_artifacts = $3, worker_id = NULL, \
                 started_at = NULL, updated_at = now() \
             WHERE id = $1 AND worker_id = $2 AND status = 'running'",
            id,
            worker,
            Some(&inputs),
            None,
        )
        .await
    }

    async fn retry(&self, id: JobId, reason: &str) -> Result<RetryDecision, StoreError> {
        let sql = format!(
            "UPDATE jobs SET status = 'pending', worker_id = NULL, started_at = NULL, \
                 completed_at = NULL, updated_at = now() \
             WHERE id = $1 AND status = 'failed' AND attempts < max_attempts \
             RETURNING {JOB_COLUMNS}"
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin retry", e))?;
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry", e))?;
        if let Some(row) = row {
            let job = job_from_row(&row)?;
            self.insert_event(&mut *tx, &NewEvent::log(&job, reason)).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit retry", e))?;
            return Ok(RetryDecision::Requeued(job));
        }
        drop(tx);

        let job = self.get_job(id).await?.ok_or(StoreError::NotFound(id))?;
        if job.status == JobStatus::Failed {
            Ok(RetryDecision::Exhausted(job))
        } else {
            Ok(RetryDecision::NotFailed(job))
        }
    }

    async fn cancel(&self, id: JobId) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE jobs SET status = 'cancelled', completed_at = now(), updated_at = now() \
             WHERE id = $1 AND status IN ('pending', 'claimed', 'running') \
             RETURNING {JOB_COLUMNS}"
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin cancel", e))?;
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;
        if let Some(row) = row {
            let job = job_from_row(&row)?;
            self.insert_event(&mut *tx, &NewEvent::cancelled(&job)).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit cancel", e))?;
            return Ok(true);
        }
        drop(tx);

        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_event(&self, event: NewEvent) -> Result<JobEvent, StoreError> {
        self.insert_event(&self.pool, &event).await
    }

    async fn list_events(&self, id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM job_events WHERE job_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list events", e))?;
        rows.iter().map(event_from_row).collect()
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts by status", e))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Decode(format!("status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| StoreError::Decode(format!("n: {e}")))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e| StoreError::Decode(format!("status: {e}")))?;
            counts.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

fn qualified_job_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_i32(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Backend(format!("{column} out of range: {value}")))
}

fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Decode(format!("{operation}: column {index}: {source}"))
        }
        sqlx::Error::Decode(source) => StoreError::Decode(format!("{operation}: {source}")),
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_columns_prefix_every_column() {
        let cols = qualified_job_columns("j");
        assert!(cols.starts_with("j.id, j.book_id"));
        assert!(cols.ends_with("j.completed_at"));
        assert_eq!(cols.matches("j.").count(), JOB_COLUMNS.split(',').count());
    }

    #[test]
    fn migration_creates_cascading_event_log() {
        assert!(MIGRATION.contains("CREATE TABLE IF NOT EXISTS jobs"));
        assert!(MIGRATION.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn attempts_out_of_range_is_rejected() {
        assert!(to_i32("max_attempts", u32::MAX).is_err());
        assert_eq!(to_i32("max_attempts", 3), Ok(3));
    }
}
