//! Row decoding (manual, `try_get` per column).

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;

use bindery_core::domain::{
    Artifacts, EventId, EventType, Job, JobEvent, JobId, JobStatus, Step, StoreError, WorkerId,
};

pub(crate) const JOB_COLUMNS: &str = "id, book_id, chapter, section, step, status, priority, \
     depends_on, input_artifacts, output_artifacts, worker_id, attempts, max_attempts, error, \
     created_at, updated_at, started_at, completed_at";

pub(crate) const EVENT_COLUMNS: &str =
    "id, job_id, book_id, event_type, progress, message, metadata, created_at";

fn decode_err(column: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(format!("{column}: {err}"))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| decode_err(column, e))
}

fn parse_job_id(column: &str, raw: &str) -> Result<JobId, StoreError> {
    raw.parse().map_err(|e| decode_err(column, e))
}

fn to_u32(column: &str, raw: i32) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|e| decode_err(column, e))
}

pub(crate) fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: String = get(row, "id")?;
    let status: String = get(row, "status")?;
    let step: String = get(row, "step")?;
    let depends_on: Vec<String> = get(row, "depends_on")?;
    let inputs: Json<Artifacts> = get(row, "input_artifacts")?;
    let outputs: Json<Artifacts> = get(row, "output_artifacts")?;
    let worker_id: Option<String> = get(row, "worker_id")?;

    Ok(Job {
        id: parse_job_id("id", &id)?,
        book_id: get(row, "book_id")?,
        chapter: get(row, "chapter")?,
        section: get(row, "section")?,
        step: Step::from(step.as_str()),
        status: status
            .parse::<JobStatus>()
            .map_err(|e| decode_err("status", e))?,
        priority: get(row, "priority")?,
        depends_on: depends_on
            .iter()
            .map(|raw| parse_job_id("depends_on", raw))
            .collect::<Result<_, _>>()?,
        input_artifacts: inputs.0,
        output_artifacts: outputs.0,
        worker_id: worker_id.map(WorkerId::new),
        attempts: to_u32("attempts", get(row, "attempts")?)?,
        max_attempts: to_u32("max_attempts", get(row, "max_attempts")?)?,
        error: get(row, "error")?,
        created_at: get::<DateTime<Utc>>(row, "created_at")?,
        updated_at: get::<DateTime<Utc>>(row, "updated_at")?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
    })
}

pub(crate) fn event_from_row(row: &PgRow) -> Result<JobEvent, StoreError> {
    let id: String = get(row, "id")?;
    let job_id: String = get(row, "job_id")?;
    let event_type: String = get(row, "event_type")?;
    let progress: Option<i16> = get(row, "progress")?;
    let metadata: Json<serde_json::Value> = get(row, "metadata")?;

    Ok(JobEvent {
        id: id.parse::<EventId>().map_err(|e| decode_err("id", e))?,
        job_id: parse_job_id("job_id", &job_id)?,
        book_id: get(row, "book_id")?,
        event_type: event_type
            .parse::<EventType>()
            .map_err(|e| decode_err("event_type", e))?,
        progress: progress
            .map(|p| u8::try_from(p).map_err(|e| decode_err("progress", e)))
            .transpose()?,
        message: get(row, "message")?,
        metadata: metadata.0,
        created_at: get(row, "created_at")?,
    })
}
