//! Status - キューの集計ビュー（inspection tooling 用）

use serde::{Deserialize, Serialize};

use crate::domain::JobStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Claimed => self.claimed += n,
            JobStatus::Running => self.running += n,
            JobStatus::Done => self.done += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Claimed => self.claimed,
            JobStatus::Running => self.running,
            JobStatus::Done => self.done,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.into_iter().map(|s| self.get(s)).sum()
    }

    /// Jobs that may still run (pending or held by a worker).
    pub fn active(&self) -> usize {
        self.pending + self.claimed + self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_status() {
        let mut counts = QueueCounts::default();
        counts.add(JobStatus::Pending, 2);
        counts.add(JobStatus::Running, 1);
        counts.add(JobStatus::Done, 4);

        assert_eq!(counts.get(JobStatus::Pending), 2);
        assert_eq!(counts.active(), 3);
        assert_eq!(counts.total(), 7);
    }
}
