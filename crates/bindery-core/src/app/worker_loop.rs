//! WorkerLoop - claim → dispatch → execute → finalize
//!
//! # フロー（1 iteration）
//! 1. `JobStore::claim_next` で次のジョブを取得（なければ idle_interval だけ待つ）
//! 2. `mark_running`、`progress(0)` イベント、heartbeat 開始
//! 3. ExecutorRegistry から executor を解決して実行（panic は job failure）
//! 4. outcome に応じて `complete` / `fail` / `requeue` + `reclaim`
//!
//! Worker writes are conditional on ownership. When the store answers
//! `false` the job was cancelled or taken over, and the worker drops it
//! without writing anything else.
//!
//! Store errors abort the iteration. After `max_consecutive_store_errors`
//! failing iterations in a row `run` gives up with `WorkerError::StoreUnavailable`.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::app::config::WorkerConfig;
use crate::app::heartbeat::Heartbeat;
use crate::app::registry::ExecutorRegistry;
use crate::domain::{
    Job, JobId, NewEvent, Step, StepError, StepOutcome, StoreError, WorkerId, truncate_error,
};
use crate::ports::{EventSink, JobStore, RetryDecision, StepExecutor};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job store unavailable after {consecutive} consecutive failures: {last}")]
    StoreUnavailable {
        consecutive: u32,
        #[source]
        last: StoreError,
    },

    #[error("worker task aborted: {0}")]
    Join(String),
}

/// Per-worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs claimed through `claim_next`.
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    /// Failed jobs put back to pending by the transient-error retry.
    pub retried: u64,
    /// Continuations (one per `Yield` outcome).
    pub yielded: u64,
    /// Jobs dropped after losing ownership.
    pub abandoned: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.done += other.done;
        self.failed += other.failed;
        self.retried += other.retried;
        self.yielded += other.yielded;
        self.abandoned += other.abandoned;
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Done,
    Failed { error: String, retried: bool },
    /// Ownership was lost (cancelled, or re-claimed by someone else after a yield).
    Abandoned { reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub step: Step,
    pub yields: u32,
    pub disposition: Disposition,
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Processed(JobReport),
}

pub struct Worker {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    sink: Arc<dyn EventSink>,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn EventSink>,
        registry: Arc<ExecutorRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            store,
            sink,
            registry,
            config,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Loop until shutdown is requested (or the sender is dropped).
    ///
    /// Shutdown is checked between iterations only: an in-flight job runs
    /// to its end.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, WorkerError> {
        let max_errors = self.config.max_consecutive_store_errors.max(1);
        let mut consecutive: u32 = 0;
        tracing::info!(worker_id = %self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(Tick::Processed(_)) => {
                    consecutive = 0;
                    None
                }
                Ok(Tick::Idle) => {
                    consecutive = 0;
                    tracing::debug!(worker_id = %self.id, "no claimable job");
                    Some(self.config.idle_interval)
                }
                Err(err) => {
                    consecutive += 1;
                    tracing::error!(
                        worker_id = %self.id,
                        error = %err,
                        consecutive,
                        "store error, backing off"
                    );
                    if consecutive >= max_errors {
                        return Err(WorkerError::StoreUnavailable {
                            consecutive,
                            last: err,
                        });
                    }
                    Some(self.config.store_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        tracing::info!(worker_id = %self.id, stats = ?self.stats, "worker stopped");
        Ok(self.stats)
    }

    /// One iteration: claim and fully process at most one job.
    pub async fn run_once(&mut self) -> Result<Tick, StoreError> {
        let Some(job) = self.store.claim_next(&self.id).await? else {
            return Ok(Tick::Idle);
        };
        self.stats.processed += 1;
        tracing::info!(
            job_id = %job.id,
            step = %job.step,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "job claimed"
        );

        let span = tracing::info_span!("job", job_id = %job.id, step = %job.step, worker_id = %self.id);
        let report = self.process(job).instrument(span).await?;
        Ok(Tick::Processed(report))
    }

    async fn process(&mut self, mut job: Job) -> Result<JobReport, StoreError> {
        let mut yields = 0u32;

        if !self.store.mark_running(job.id, &self.id).await? {
            return Ok(self.abandon(&job, yields, "lost before start"));
        }
        self.emit(NewEvent::progress(&job, Some(0), None)).await;
        let mut heartbeat = self.heartbeat(&job);

        let executor = match self.registry.resolve(&job.step).await {
            Ok(executor) => executor,
            Err(err) => {
                let disposition = self.fail(&job, StepError::permanent(err.to_string())).await?;
                return Ok(self.report(&job, yields, disposition));
            }
        };

        loop {
            match invoke(Arc::clone(&executor), &job, &self.id).await {
                Ok(StepOutcome::Done { outputs }) => {
                    if !self.store.complete(job.id, &self.id, outputs).await? {
                        return Ok(self.abandon(&job, yields, "lost before completion"));
                    }
                    self.stats.done += 1;
                    tracing::info!(job_id = %job.id, yields, "job done");
                    self.emit(NewEvent::done(&job)).await;
                    return Ok(self.report(&job, yields, Disposition::Done));
                }
                Ok(StepOutcome::Yield {
                    next_inputs,
                    progress,
                    message,
                }) => {
                    yields += 1;
                    if yields > self.config.max_yields {
                        let err = StepError::permanent(format!(
                            "exceeded yield budget ({})",
                            self.config.max_yields
                        ));
                        let disposition = self.fail(&job, err).await?;
                        return Ok(self.report(&job, yields, disposition));
                    }

                    if !self.store.requeue(job.id, &self.id, next_inputs).await? {
                        return Ok(self.abandon(&job, yields, "lost before requeue"));
                    }
                    self.stats.yielded += 1;
                    tracing::debug!(job_id = %job.id, yields, progress = ?progress, "job yielded");
                    self.emit(NewEvent::progress(&job, progress, message)).await;

                    // requeue で ownership を一度手放すので heartbeat も張り直す
                    drop(heartbeat);
                    let Some(resumed) = self.store.reclaim(job.id, &self.id).await? else {
                        return Ok(self.abandon(&job, yields, "re-claimed by another worker"));
                    };
                    job = resumed;
                    if !self.store.mark_running(job.id, &self.id).await? {
                        return Ok(self.abandon(&job, yields, "lost after re-claim"));
                    }
                    heartbeat = self.heartbeat(&job);
                }
                Err(err) => {
                    let disposition = self.fail(&job, err).await?;
                    return Ok(self.report(&job, yields, disposition));
                }
            }
        }
    }

    /// running -> failed, then the transient-error retry when attempts remain.
    async fn fail(&mut self, job: &Job, err: StepError) -> Result<Disposition, StoreError> {
        let message = truncate_error(err.message(), self.config.error_max_len);
        if !self.store.fail(job.id, &self.id, &message).await? {
            self.stats.abandoned += 1;
            tracing::warn!(job_id = %job.id, "job no longer owned, failure not recorded");
            return Ok(Disposition::Abandoned {
                reason: "lost before failure",
            });
        }
        self.stats.failed += 1;
        tracing::warn!(
            job_id = %job.id,
            attempt = job.attempts,
            transient = err.is_transient(),
            error = %message,
            "job failed"
        );
        self.emit(NewEvent::error(job, message.clone())).await;

        let mut retried = false;
        if err.is_transient() && job.has_attempts_left() {
            let note = format!(
                "retry scheduled after transient error (attempt {}/{})",
                job.attempts, job.max_attempts
            );
            // store が note を log イベントとして同じ書き込みで記録する
            if let RetryDecision::Requeued(_) = self.store.retry(job.id, &note).await? {
                retried = true;
                self.stats.retried += 1;
                tracing::info!(job_id = %job.id, "{note}");
            }
        }
        Ok(Disposition::Failed {
            error: message,
            retried,
        })
    }

    fn abandon(&mut self, job: &Job, yields: u32, reason: &'static str) -> JobReport {
        self.stats.abandoned += 1;
        tracing::warn!(job_id = %job.id, reason, "job abandoned");
        self.report(job, yields, Disposition::Abandoned { reason })
    }

    fn report(&self, job: &Job, yields: u32, disposition: Disposition) -> JobReport {
        JobReport {
            job_id: job.id,
            step: job.step.clone(),
            yields,
            disposition,
        }
    }

    fn heartbeat(&self, job: &Job) -> Heartbeat {
        Heartbeat::start(
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            job,
            self.id.clone(),
            self.config.heartbeat_interval,
        )
    }

    async fn emit(&self, event: NewEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.sink.emit(event).await {
            tracing::warn!(event = %event_type, error = %e, "event not recorded");
        }
    }
}

/// Run the executor on its own task so a panic surfaces as a `JoinError`.
async fn invoke(
    executor: Arc<dyn StepExecutor>,
    job: &Job,
    worker: &WorkerId,
) -> Result<StepOutcome, StepError> {
    let job = job.clone();
    let worker = worker.clone();
    let handle = tokio::spawn(async move { executor.execute(&job, &worker).await });
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(StepError::permanent(format!(
            "executor panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(StepError::transient(format!("executor task cancelled: {e}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Worker group handle.
/// - `shutdown_tx` を drop するとワーカー全体が止まる
/// - `join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: Arc<watch::Sender<bool>>,
    joins: JoinSet<Result<WorkerStats, WorkerError>>,
}

/// Cloneable shutdown trigger for a `WorkerGroup` (signal handlers etc.).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        let _ = self.tx.send(true);
    }
}

impl WorkerGroup {
    pub fn spawn(workers: Vec<Worker>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = JoinSet::new();
        for worker in workers {
            joins.spawn(worker.run(shutdown_rx.clone()));
        }
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            joins,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new jobs. In-flight jobs finish first.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every worker. The first worker error shuts the rest down and
    /// is returned once all have stopped.
    pub async fn join(mut self) -> Result<WorkerStats, WorkerError> {
        let mut total = WorkerStats::default();
        let mut first_error = None;

        while let Some(joined) = self.joins.join_next().await {
            let result = joined.map_err(|e| WorkerError::Join(e.to_string())).and_then(|r| r);
            match result {
                Ok(stats) => total.merge(&stats),
                Err(err) => {
                    tracing::error!(error = %err, "worker exited with error, stopping group");
                    let _ = self.shutdown_tx.send(true);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    pub async fn shutdown_and_join(self) -> Result<WorkerStats, WorkerError> {
        self.request_shutdown();
        self.join().await
    }
}
