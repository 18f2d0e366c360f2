//! EventSink port - イベント記録の抽象化
//!
//! Emission is best-effort: the worker logs a failed `emit` and carries on.
//!
//! # 実装
//! - StoreEventSink: JobStore のイベントログに append（本番用）
//! - TracingEventSink: tracing に流すだけ（store を持たないツール用）

use async_trait::async_trait;

use crate::domain::NewEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event sink error: {0}")]
pub struct EventSinkError(pub String);

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: NewEvent) -> Result<(), EventSinkError>;
}
