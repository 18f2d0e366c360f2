//! StepExecutor port - step の実処理を行う外部コラボレータ
//!
//! The queue never interprets `job.input_artifacts`; an executor reads its
//! inputs from there and hands back either outputs or continuation inputs.

use async_trait::async_trait;

use crate::domain::{Job, StepError, StepOutcome, WorkerId};

/// Performs the work of one step.
///
/// Each call is a fresh, stateless invocation: after a yield the next call
/// sees the continuation data in `job.input_artifacts`.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, job: &Job, worker: &WorkerId) -> Result<StepOutcome, StepError>;
}
