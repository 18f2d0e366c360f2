//! StoreEventSink - JobStore のイベントログに append する EventSink

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::NewEvent;
use crate::ports::{EventSink, EventSinkError, JobStore};

/// Appends every event to the store's per-job event log.
pub struct StoreEventSink {
    store: Arc<dyn JobStore>,
}

impl StoreEventSink {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for StoreEventSink {
    async fn emit(&self, event: NewEvent) -> Result<(), EventSinkError> {
        self.store
            .append_event(event)
            .await
            .map(|_| ())
            .map_err(|e| EventSinkError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, NewJob, Step};
    use crate::impls::InMemoryJobStore;

    #[tokio::test]
    async fn emitted_events_land_in_the_job_log() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store
            .insert_job(NewJob::new("vth-n4", Step::RenderHtml))
            .await
            .unwrap();
        let sink = StoreEventSink::new(store.clone());

        sink.emit(NewEvent::progress(&job, Some(0), None)).await.unwrap();
        sink.emit(NewEvent::done(&job)).await.unwrap();

        let types: Vec<EventType> = store
            .list_events(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec![EventType::Progress, EventType::Done]);
    }

    #[tokio::test]
    async fn event_for_deleted_job_is_an_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store
            .insert_job(NewJob::new("vth-n4", Step::RenderHtml))
            .await
            .unwrap();
        store.delete_job(job.id).await.unwrap();

        let sink = StoreEventSink::new(store);
        assert!(sink.emit(NewEvent::heartbeat(&job)).await.is_err());
    }
}
