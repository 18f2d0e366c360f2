//! TracingEventSink - イベントを tracing に流すだけの EventSink
//!
//! store にイベントログを持たない構成（ローカル実行、CLI の dry-run）で使う。

use async_trait::async_trait;

use crate::domain::{EventType, NewEvent};
use crate::ports::{EventSink, EventSinkError};

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: NewEvent) -> Result<(), EventSinkError> {
        let job_id = event.job_id.to_string();
        let message = event.message.as_deref().unwrap_or("");
        match event.event_type {
            EventType::Error => tracing::warn!(
                job_id = %job_id,
                book_id = %event.book_id,
                event = %event.event_type,
                "{message}"
            ),
            EventType::Heartbeat => tracing::debug!(
                job_id = %job_id,
                book_id = %event.book_id,
                "heartbeat"
            ),
            _ => tracing::info!(
                job_id = %job_id,
                book_id = %event.book_id,
                event = %event.event_type,
                progress = ?event.progress,
                "{message}"
            ),
        }
        Ok(())
    }
}
