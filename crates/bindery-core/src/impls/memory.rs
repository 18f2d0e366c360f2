//! In-memory job store (tests / local development).
//!
//! Every operation runs under one `tokio::sync::Mutex` guard, so the
//! select-and-update of `claim_next` is atomic with respect to every other
//! caller in the process. There is no skip-locked here: concurrent claimers
//! simply queue on the mutex, which is fine for a single process.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::app::status::QueueCounts;
use crate::domain::{
    Artifacts, Job, JobEvent, JobFilter, JobId, JobStatus, NewEvent, NewJob, StoreError, WorkerId,
};
use crate::ports::{Clock, IdGenerator, JobStore, RetryDecision, SystemClock, UlidGenerator};

/// Job + insertion sequence (final tie-break after created_at).
#[derive(Debug, Clone)]
struct Slot {
    job: Job,
    seq: u64,
}

#[derive(Default)]
struct InMemoryStoreState {
    jobs: HashMap<JobId, Slot>,
    events: Vec<JobEvent>,
    next_seq: u64,
}

impl InMemoryStoreState {
    fn dependencies_done(&self, job: &Job) -> bool {
        job.depends_on.iter().all(|dep| {
            self.jobs
                .get(dep)
                .is_some_and(|slot| slot.job.status == JobStatus::Done)
        })
    }

    fn is_claimable(&self, job: &Job) -> bool {
        job.status == JobStatus::Pending && job.has_attempts_left() && self.dependencies_done(job)
    }

    fn next_claimable(&self) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|slot| self.is_claimable(&slot.job))
            .min_by_key(|slot| (Reverse(slot.job.priority), slot.job.created_at, slot.seq))
            .map(|slot| slot.job.id)
    }

    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id, Slot { job, seq });
    }

    /// Mutable access to a job running under `worker`.
    fn running_for(&mut self, id: JobId, worker: &WorkerId) -> Option<&mut Job> {
        self.jobs
            .get_mut(&id)
            .map(|slot| &mut slot.job)
            .filter(|job| job.status == JobStatus::Running && job.is_owned_by(worker))
    }
}

pub struct InMemoryJobStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock<C: Clock + Clone + 'static>(clock: C) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState::default())),
            clock: Arc::new(clock.clone()),
            ids: Arc::new(UlidGenerator::new(clock)),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Fault injection: while set, every operation fails with `StoreError::Backend`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn build(&self, new: NewJob) -> Job {
        let id = new.id.unwrap_or_else(|| self.ids.generate_job_id());
        Job::from_new(id, new, self.clock.now())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.insert_jobs(vec![job]).await?;
        jobs.pop()
            .ok_or_else(|| StoreError::Backend("batch insert returned no job".to_string()))
    }

    async fn insert_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        for job in &jobs {
            job.validate()?;
        }
        let built: Vec<Job> = jobs.into_iter().map(|new| self.build(new)).collect();

        let mut state = self.state.lock().await;
        let mut seen = std::collections::HashSet::new();
        for job in &built {
            if state.jobs.contains_key(&job.id) || !seen.insert(job.id) {
                return Err(StoreError::AlreadyExists(job.id));
            }
        }
        for job in &built {
            state.insert(job.clone());
        }
        Ok(built)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).map(|slot| slot.job.clone()))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut slots: Vec<&Slot> = state
            .jobs
            .values()
            .filter(|slot| filter.matches(&slot.job))
            .collect();
        slots.sort_by_key(|slot| (slot.job.created_at, slot.seq));
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(slots.into_iter().take(limit).map(|slot| slot.job.clone()).collect())
    }

    async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(id) = state.next_claimable() else {
            return Ok(None);
        };
        let now = self.clock.now();
        let Some(slot) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        slot.job.claim(worker, now);
        Ok(Some(slot.job.clone()))
    }

    async fn reclaim(&self, id: JobId, worker: &WorkerId) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(slot) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if slot.job.status != JobStatus::Pending || slot.job.worker_id.is_some() {
            return Ok(None);
        }
        slot.job.resume(worker, now);
        Ok(Some(slot.job.clone()))
    }

    async fn mark_running(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        match state.jobs.get_mut(&id).map(|slot| &mut slot.job) {
            Some(job) if job.is_owned_by(worker) => {
                if job.status == JobStatus::Claimed {
                    job.mark_running(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        match state.jobs.get_mut(&id).map(|slot| &mut slot.job) {
            Some(job) if job.is_owned_by(worker) => {
                job.touch(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        outputs: Artifacts,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(job) = state.running_for(id, worker) else {
            return Ok(false);
        };
        job.mark_done(outputs, now);
        Ok(true)
    }

    async fn fail(&self, id: JobId, worker: &WorkerId, error: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(job) = state.running_for(id, worker) else {
            return Ok(false);
        };
        job.mark_failed(error.to_string(), now);
        Ok(true)
    }

    async fn requeue(
        &self,
        id: JobId,
        worker: &WorkerId,
        inputs: Artifacts,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(job) = state.running_for(id, worker) else {
            return Ok(false);
        };
        job.requeue(inputs, now);
        Ok(true)
    }

    async fn retry(&self, id: JobId, reason: &str) -> Result<RetryDecision, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let slot = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let job = &mut slot.job;
        if job.status != JobStatus::Failed {
            return Ok(RetryDecision::NotFailed(job.clone()));
        }
        if !job.has_attempts_left() {
            return Ok(RetryDecision::Exhausted(job.clone()));
        }
        job.reset_for_retry(now);
        let job = job.clone();
        let event = NewEvent::log(&job, reason).into_event(self.ids.generate_event_id(), now);
        state.events.push(event);
        Ok(RetryDecision::Requeued(job))
    }

    async fn cancel(&self, id: JobId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let slot = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if slot.job.status.is_terminal() {
            return Ok(false);
        }
        slot.job.mark_cancelled(now);
        let event = NewEvent::cancelled(&slot.job).into_event(self.ids.generate_event_id(), now);
        state.events.push(event);
        Ok(true)
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.jobs.remove(&id).is_none() {
            return Ok(false);
        }
        state.events.retain(|event| event.job_id != id);
        Ok(true)
    }

    async fn append_event(&self, event: NewEvent) -> Result<JobEvent, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&event.job_id) {
            return Err(StoreError::NotFound(event.job_id));
        }
        let stored = event.into_event(self.ids.generate_event_id(), self.clock.now());
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_events(&self, id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|event| event.job_id == id)
            .cloned()
            .collect())
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for slot in state.jobs.values() {
            counts.add(slot.job.status, 1);
        }
        Ok(counts)
    }
}
