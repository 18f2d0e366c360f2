//! Event log entries.
//!
//! Append-only facts about a job's progress. Dashboards read these; the
//! scheduler never does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{EventId, JobId};
use super::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progress,
    Heartbeat,
    Log,
    Error,
    Done,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Progress => "progress",
            EventType::Heartbeat => "heartbeat",
            EventType::Log => "log",
            EventType::Error => "error",
            EventType::Done => "done",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0:?}")]
pub struct ParseEventTypeError(pub String);

impl FromStr for EventType {
    type Err = ParseEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(EventType::Progress),
            "heartbeat" => Ok(EventType::Heartbeat),
            "log" => Ok(EventType::Log),
            "error" => Ok(EventType::Error),
            "done" => Ok(EventType::Done),
            other => Err(ParseEventTypeError(other.to_string())),
        }
    }
}

/// A stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: EventId,
    pub job_id: JobId,
    /// Scope id of the job (copied so dashboards can filter per book).
    pub book_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub job_id: JobId,
    pub book_id: String,
    pub event_type: EventType,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewEvent {
    pub fn new(job: &Job, event_type: EventType) -> Self {
        Self {
            job_id: job.id,
            book_id: job.book_id.clone(),
            event_type,
            progress: None,
            message: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn progress(job: &Job, progress: Option<u8>, message: Option<String>) -> Self {
        let mut event = Self::new(job, EventType::Progress);
        event.progress = progress.map(|p| p.min(100));
        event.message = message;
        event
    }

    pub fn heartbeat(job: &Job) -> Self {
        Self::new(job, EventType::Heartbeat)
    }

    pub fn log(job: &Job, message: impl Into<String>) -> Self {
        Self::new(job, EventType::Log).with_message(message)
    }

    /// Recorded by the store when a job is cancelled from outside.
    pub fn cancelled(job: &Job) -> Self {
        Self::log(job, "cancelled")
    }

    pub fn error(job: &Job, message: impl Into<String>) -> Self {
        Self::new(job, EventType::Error).with_message(message)
    }

    pub fn done(job: &Job) -> Self {
        let mut event = Self::new(job, EventType::Done);
        event.progress = Some(100);
        event
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn into_event(self, id: EventId, created_at: DateTime<Utc>) -> JobEvent {
        JobEvent {
            id,
            job_id: self.job_id,
            book_id: self.book_id,
            event_type: self.event_type,
            progress: self.progress,
            message: self.message,
            metadata: self.metadata,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, NewJob, Step};
    use ulid::Ulid;

    fn job() -> Job {
        Job::from_new(
            JobId::from_ulid(Ulid::new()),
            NewJob::new("pathologie", Step::RenderHtml),
            Utc::now(),
        )
    }

    #[test]
    fn progress_is_clamped_to_100() {
        let event = NewEvent::progress(&job(), Some(250), None);
        assert_eq!(event.progress, Some(100));
    }

    #[test]
    fn done_event_reports_full_progress() {
        let job = job();
        let event = NewEvent::done(&job);
        assert_eq!(event.event_type, EventType::Done);
        assert_eq!(event.progress, Some(100));
        assert_eq!(event.book_id, "pathologie");
    }

    #[test]
    fn event_type_text_roundtrip() {
        for t in [
            EventType::Progress,
            EventType::Heartbeat,
            EventType::Log,
            EventType::Error,
            EventType::Done,
        ] {
            assert_eq!(t.as_str().parse::<EventType>(), Ok(t));
        }
    }
}
