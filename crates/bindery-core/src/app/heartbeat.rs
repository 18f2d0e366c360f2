//! Heartbeat - 実行中ジョブの liveness 表示
//!
//! `Heartbeat::start` spawns a ticker that bumps `updated_at` through
//! `JobStore::touch` and emits a `heartbeat` event. The ticker ends when the
//! guard is dropped or when `touch` reports the worker no longer owns the job.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::{Job, NewEvent, WorkerId};
use crate::ports::{EventSink, JobStore};

/// RAII guard: dropping it aborts the ticker.
#[must_use = "the heartbeat stops as soon as the guard is dropped"]
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn EventSink>,
        job: &Job,
        worker: WorkerId,
        interval: Duration,
    ) -> Self {
        let job = job.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval の最初の tick は即座に完了するので読み捨てる
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match store.touch(job.id, &worker).await {
                    Ok(true) => {
                        tracing::debug!(job_id = %job.id, worker_id = %worker, "heartbeat");
                        if let Err(e) = sink.emit(NewEvent::heartbeat(&job)).await {
                            tracing::warn!(job_id = %job.id, error = %e, "heartbeat event not recorded");
                        }
                    }
                    Ok(false) => {
                        tracing::warn!(job_id = %job.id, worker_id = %worker, "heartbeat stopped: job no longer owned");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "heartbeat touch failed");
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
