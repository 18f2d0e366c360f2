//! Job record and its transitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::ids::{JobId, WorkerId};
use super::state::JobStatus;
use super::step::Step;

/// Opaque key -> reference map (paths / URIs into the artifact store).
///
/// The queue never looks inside; executors own the meaning of every key.
pub type Artifacts = BTreeMap<String, String>;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job record: the single source of truth for one schedulable unit.
///
/// Design:
/// - State transitions via methods (not direct field access) so the
///   in-memory store and the domain agree on what each transition touches.
/// - `depends_on` is trusted as given by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Scope keys (bookkeeping only, never used for scheduling).
    pub book_id: String,
    pub chapter: Option<String>,
    pub section: Option<String>,

    pub step: Step,
    pub status: JobStatus,
    pub priority: i32,
    pub depends_on: Vec<JobId>,

    pub input_artifacts: Artifacts,
    pub output_artifacts: Artifacts,

    pub worker_id: Option<WorkerId>,

    /// Successful claims so far (including the current one while owned).
    pub attempts: u32,
    pub max_attempts: u32,

    /// Last failure message (truncated).
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            book_id: new.book_id,
            chapter: new.chapter,
            section: new.section,
            step: new.step,
            status: JobStatus::Pending,
            priority: new.priority,
            depends_on: new.depends_on,
            input_artifacts: new.input_artifacts,
            output_artifacts: Artifacts::new(),
            worker_id: None,
            attempts: 0,
            max_attempts: new.max_attempts,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Is `worker` the current claim holder?
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status.is_owned() && self.worker_id.as_ref() == Some(worker)
    }

    /// Pending -> Claimed, consuming one attempt.
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.resume(worker, now);
        self.attempts += 1;
    }

    /// Pending -> Claimed for a yield continuation (attempts unchanged).
    pub fn resume(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.worker_id = Some(worker.clone());
        self.started_at = Some(now);
        self.error = None;
        self.updated_at = now;
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.updated_at = now;
    }

    /// Heartbeat.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub fn mark_done(&mut self, outputs: Artifacts, now: DateTime<Utc>) {
        self.status = JobStatus::Done;
        self.output_artifacts = outputs;
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Running -> Pending with the continuation inputs.
    pub fn requeue(&mut self, inputs: Artifacts, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.input_artifacts = inputs;
        self.worker_id = None;
        self.started_at = None;
        self.updated_at = now;
    }

    /// Failed -> Pending. The last error stays until the next claim.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Planner input for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Pre-assigned id (the planner needs ids up front to wire `depends_on`).
    #[serde(default)]
    pub id: Option<JobId>,
    pub book_id: String,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    pub step: Step,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    #[serde(default)]
    pub input_artifacts: Artifacts,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl NewJob {
    pub fn new(book_id: impl Into<String>, step: impl Into<Step>) -> Self {
        Self {
            id: None,
            book_id: book_id.into(),
            chapter: None,
            section: None,
            step: step.into(),
            priority: 0,
            depends_on: Vec::new(),
            input_artifacts: Artifacts::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_chapter(mut self, chapter: impl Into<String>) -> Self {
        self.chapter = Some(chapter.into());
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input_artifacts.insert(key.into(), value.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Checked by every store before anything is written.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_attempts == 0 {
            return Err(StoreError::InvalidJob(format!(
                "{} job for {}: max_attempts must be at least 1",
                self.step, self.book_id
            )));
        }
        Ok(())
    }
}

/// Inspection filter for `JobStore::list_jobs`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub book_id: Option<String>,
    pub status: Option<JobStatus>,
    pub step: Option<Step>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn book(book_id: impl Into<String>) -> Self {
        Self {
            book_id: Some(book_id.into()),
            ..Self::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.book_id.as_ref().is_none_or(|b| *b == job.book_id)
            && self.status.is_none_or(|s| s == job.status)
            && self.step.as_ref().is_none_or(|s| *s == job.step)
    }
}

/// Truncate an error message to at most `max_chars` characters.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &message[..idx]),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn job() -> Job {
        let new = NewJob::new("vth-n4", Step::Rewrite)
            .with_chapter("3")
            .with_input("canonical", "s3://books/vth-n4/ch3.json");
        Job::from_new(JobId::from_ulid(Ulid::new()), new, Utc::now())
    }

    #[test]
    fn new_job_starts_pending_without_attempts() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn claim_counts_attempt_and_resume_does_not() {
        let worker = WorkerId::new("w1");
        let mut job = job();
        job.error = Some("old".to_string());

        job.claim(&worker, Utc::now());
        assert_eq!(job.attempts, 1);
        assert!(job.error.is_none());
        assert!(job.is_owned_by(&worker));

        job.mark_running(Utc::now());
        job.requeue(Artifacts::from([("cursor".into(), "2".into())]), Utc::now());
        assert!(job.worker_id.is_none());
        assert!(job.started_at.is_none());

        job.resume(&worker, Utc::now());
        assert_eq!(job.attempts, 1);
        assert_eq!(job.input_artifacts["cursor"], "2");
    }

    #[test]
    fn done_clears_error() {
        let mut job = job();
        job.claim(&WorkerId::new("w1"), Utc::now());
        job.error = Some("stale".to_string());
        job.mark_done(Artifacts::from([("html".into(), "out/ch3.html".into())]), Utc::now());

        assert_eq!(job.status, JobStatus::Done);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn filter_matches_on_all_set_fields() {
        let job = job();
        assert!(JobFilter::book("vth-n4").matches(&job));
        assert!(JobFilter::book("vth-n4").with_step(Step::Rewrite).matches(&job));
        assert!(!JobFilter::book("pathologie").matches(&job));
        assert!(!JobFilter::status(JobStatus::Done).matches(&job));
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        assert_eq!(truncate_error("short", 10), "short");
        assert_eq!(truncate_error("ëëëëë", 2), "ëë…");
    }

    #[test]
    fn new_job_deserializes_with_defaults() {
        let json = r#"{ "book_id": "vth-n4", "step": "render_pdf" }"#;
        let new: NewJob = serde_json::from_str(json).unwrap();
        assert_eq!(new.step, Step::RenderPdf);
        assert_eq!(new.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(new.depends_on.is_empty());
    }
}
