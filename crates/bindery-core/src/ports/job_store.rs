//! JobStore port - ジョブ状態の正本（source of truth）
//!
//! JobStore は以下を管理します：
//! - 状態（JobStatus）と retry accounting（attempts / max_attempts）
//! - 依存関係（depends_on）
//! - イベントログ（append-only, job 削除時に cascade）
//!
//! # 設計原則
//! - claim は select + lock + update を 1 つの不可分な操作として行う
//! - worker 側の書き込みは「今も自分が持っている」ときだけ反映される
//!   （status が claimed/running かつ worker_id が一致）。`false` は ownership を失ったことを表す
//! - ジョブ状態をプロセス内にキャッシュしない

use async_trait::async_trait;

use crate::app::status::QueueCounts;
use crate::domain::{
    Artifacts, Job, JobEvent, JobFilter, JobId, NewEvent, NewJob, StoreError, WorkerId,
};

/// Result of `JobStore::retry`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// failed -> pending; the job is claimable again.
    Requeued(Job),
    /// attempts == max_attempts: the job stays failed.
    Exhausted(Job),
    /// The job is not in `failed`.
    NotFailed(Job),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Insert a batch atomically (all or nothing).
    async fn insert_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the next eligible job for `worker`.
    ///
    /// Eligible: `pending`, `attempts < max_attempts`, every dependency `done`.
    /// Order: priority desc, then created_at asc. Claiming increments
    /// `attempts`, stamps `worker_id` / `started_at` and clears `error`.
    /// Returns `Ok(None)` when nothing is eligible.
    async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, StoreError>;

    /// Re-claim a job this worker just requeued through a yield.
    ///
    /// Succeeds only while the job is still `pending` and unclaimed since the
    /// requeue. Does not consume an attempt.
    async fn reclaim(&self, id: JobId, worker: &WorkerId) -> Result<Option<Job>, StoreError>;

    /// claimed -> running (no-op `true` if already running for `worker`).
    async fn mark_running(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError>;

    /// Heartbeat: bump `updated_at` of an owned job.
    async fn touch(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError>;

    /// running -> done with `outputs`.
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        outputs: Artifacts,
    ) -> Result<bool, StoreError>;

    /// running -> failed with an (already truncated) error message.
    async fn fail(&self, id: JobId, worker: &WorkerId, error: &str) -> Result<bool, StoreError>;

    /// running -> pending with continuation inputs. Attempts unchanged.
    async fn requeue(
        &self,
        id: JobId,
        worker: &WorkerId,
        inputs: Artifacts,
    ) -> Result<bool, StoreError>;

    /// failed -> pending while attempts remain.
    ///
    /// A requeue appends a `log` event carrying `reason` in the same write.
    async fn retry(&self, id: JobId, reason: &str) -> Result<RetryDecision, StoreError>;

    /// pending / claimed / running -> cancelled. `false` if already terminal.
    /// A cancellation appends a `log` event ("cancelled") in the same write.
    async fn cancel(&self, id: JobId) -> Result<bool, StoreError>;

    /// Delete a job and (cascade) its events.
    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError>;

    async fn append_event(&self, event: NewEvent) -> Result<JobEvent, StoreError>;

    /// Events of one job, oldest first.
    async fn list_events(&self, id: JobId) -> Result<Vec<JobEvent>, StoreError>;

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError>;
}
