//! Job state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job status.
///
/// State transitions:
/// - Pending -> Claimed -> Running -> Done
/// - Running -> Failed (executor error, unknown step, yield budget exceeded)
/// - Running -> Pending (yield: continue with new input artifacts)
/// - Failed -> Pending (explicit retry, bounded by max_attempts)
/// - Pending / Claimed / Running -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Is this a terminal state?
    ///
    /// `Failed` counts as terminal: only an explicit retry leaves it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Claimed or running: a worker holds the job.
    pub fn is_owned(self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Running, Running)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Pending)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (Claimed, Cancelled)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
