//! Integration tests against a real PostgreSQL.
//!
//! Skipped unless `DATABASE_URL` is set. Each test runs in its own schema.

use std::collections::HashSet;
use std::sync::Arc;

use bindery_core::domain::{
    Artifacts, EventType, JobId, JobStatus, NewEvent, NewJob, Step, StoreError, WorkerId,
};
use bindery_core::ports::{IdGenerator, JobStore, RetryDecision, SystemClock, UlidGenerator};
use bindery_pg::PostgresJobStore;
use sqlx::postgres::PgConnectOptions;

async fn store() -> Option<PostgresJobStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let schema = format!(
        "bindery_test_{}",
        UlidGenerator::new(SystemClock)
            .generate_job_id()
            .as_ulid()
            .to_string()
            .to_lowercase()
    );

    let admin = PostgresJobStore::connect(&url).await.unwrap();
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(admin.pool())
        .await
        .unwrap();

    let options: PgConnectOptions = url.parse().unwrap();
    let options = options.options([("search_path", schema.as_str())]);
    let store = PostgresJobStore::connect_with(options, 8).await.unwrap();
    store.migrate().await.unwrap();
    Some(store)
}

fn worker(name: &str) -> WorkerId {
    WorkerId::new(name)
}

#[tokio::test]
async fn claim_order_and_dependencies() {
    let Some(store) = store().await else { return };
    let w = worker("w1");

    let y = store.insert_job(NewJob::new("b1", Step::ExtractText)).await.unwrap();
    let x = store
        .insert_job(NewJob::new("b1", Step::Rewrite).with_priority(100).depends_on([y.id]))
        .await
        .unwrap();
    let low = store
        .insert_job(NewJob::new("b1", Step::Validate).with_priority(-5))
        .await
        .unwrap();

    let first = store.claim_next(&w).await.unwrap().unwrap();
    assert_eq!(first.id, y.id);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.worker_id, Some(w.clone()));

    // X は Y 待ち、次は優先度の低い job
    let second = store.claim_next(&w).await.unwrap().unwrap();
    assert_eq!(second.id, low.id);

    assert!(store.mark_running(y.id, &w).await.unwrap());
    assert!(store.complete(y.id, &w, Artifacts::new()).await.unwrap());
    let third = store.claim_next(&w).await.unwrap().unwrap();
    assert_eq!(third.id, x.id);
    assert_eq!(store.claim_next(&w).await.unwrap(), None);
}

#[tokio::test]
async fn dangling_dependency_blocks() {
    let Some(store) = store().await else { return };
    let ghost = UlidGenerator::new(SystemClock).generate_job_id();
    store
        .insert_job(NewJob::new("b1", Step::Package).depends_on([ghost]))
        .await
        .unwrap();
    assert_eq!(store.claim_next(&worker("w1")).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_exclusive() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    for n in 0..30 {
        store
            .insert_job(NewJob::new("b1", Step::Rewrite).with_section(n.to_string()))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..6 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let me = WorkerId::new(format!("w{w}"));
            let mut mine: Vec<JobId> = Vec::new();
            while let Some(job) = store.claim_next(&me).await.unwrap() {
                mine.push(job.id);
            }
            mine
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}

#[tokio::test]
async fn yield_round_trip_and_retry_ceiling() {
    let Some(store) = store().await else { return };
    let w = worker("w1");
    let job = store
        .insert_job(NewJob::new("b1", Step::RenderPdf).with_max_attempts(2).with_input("page", "0"))
        .await
        .unwrap();

    store.claim_next(&w).await.unwrap().unwrap();
    store.mark_running(job.id, &w).await.unwrap();
    let next = Artifacts::from([("page".to_string(), "1".to_string())]);
    assert!(store.requeue(job.id, &w, next.clone()).await.unwrap());
    let resumed = store.reclaim(job.id, &w).await.unwrap().unwrap();
    assert_eq!(resumed.attempts, 1);
    assert_eq!(resumed.input_artifacts, next);
    assert_eq!(resumed.priority, job.priority);

    store.mark_running(job.id, &w).await.unwrap();
    store.fail(job.id, &w, "boom").await.unwrap();
    assert!(matches!(store.retry(job.id, "retry").await.unwrap(), RetryDecision::Requeued(_)));

    let again = store.claim_next(&w).await.unwrap().unwrap();
    assert_eq!(again.attempts, 2);
    assert!(again.error.is_none());
    store.mark_running(job.id, &w).await.unwrap();
    store.fail(job.id, &w, "boom again").await.unwrap();
    assert!(matches!(store.retry(job.id, "retry").await.unwrap(), RetryDecision::Exhausted(_)));

    sqlx::query("UPDATE jobs SET status = 'pending' WHERE id = $1")
        .bind(job.id.to_string())
        .execute(store.pool())
        .await
        .unwrap();
    assert_eq!(store.claim_next(&w).await.unwrap(), None);
}

#[tokio::test]
async fn ownership_guard_and_cancel() {
    let Some(store) = store().await else { return };
    let (w1, w2) = (worker("w1"), worker("w2"));
    let job = store.insert_job(NewJob::new("b1", Step::Assemble)).await.unwrap();
    store.claim_next(&w1).await.unwrap();
    store.mark_running(job.id, &w1).await.unwrap();

    assert!(!store.complete(job.id, &w2, Artifacts::new()).await.unwrap());
    assert!(store.cancel(job.id).await.unwrap());
    assert!(!store.cancel(job.id).await.unwrap());
    assert!(!store.complete(job.id, &w1, Artifacts::new()).await.unwrap());
    assert_eq!(
        store.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    let missing = UlidGenerator::new(SystemClock).generate_job_id();
    assert_eq!(store.cancel(missing).await, Err(StoreError::NotFound(missing)));
}

#[tokio::test]
async fn events_cascade_and_duplicates_are_rejected() {
    let Some(store) = store().await else { return };
    let job = store.insert_job(NewJob::new("b1", Step::RenderHtml)).await.unwrap();
    store
        .append_event(NewEvent::progress(&job, Some(40), Some("page 4/10".to_string())))
        .await
        .unwrap();
    store.append_event(NewEvent::done(&job)).await.unwrap();

    let events = store.list_events(job.id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::Progress);
    assert_eq!(events[0].progress, Some(40));

    let dup = store.insert_job(NewJob::new("b1", Step::RenderHtml).with_id(job.id)).await;
    assert_eq!(dup, Err(StoreError::AlreadyExists(job.id)));

    assert!(store.delete_job(job.id).await.unwrap());
    assert!(store.list_events(job.id).await.unwrap().is_empty());
    assert_eq!(
        store.append_event(NewEvent::heartbeat(&job)).await,
        Err(StoreError::NotFound(job.id))
    );

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts.total(), 0);
}

#[tokio::test]
async fn batch_claims_follow_insertion_order() {
    let Some(store) = store().await else { return };
    let w = worker("w1");
    let batch: Vec<NewJob> = (0..20)
        .map(|n| NewJob::new("b1", Step::Rewrite).with_section(n.to_string()))
        .collect();
    let inserted = store.insert_jobs(batch).await.unwrap();

    let mut claimed = Vec::new();
    while let Some(job) = store.claim_next(&w).await.unwrap() {
        claimed.push(job.id);
    }
    let expected: Vec<JobId> = inserted.iter().map(|j| j.id).collect();
    assert_eq!(claimed, expected);
}

#[tokio::test]
async fn cancel_and_retry_append_log_events() {
    let Some(store) = store().await else { return };
    let w = worker("w1");

    let cancelled = store.insert_job(NewJob::new("b1", Step::Package)).await.unwrap();
    assert!(store.cancel(cancelled.id).await.unwrap());
    let events = store.list_events(cancelled.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Log);
    assert_eq!(events[0].message.as_deref(), Some("cancelled"));

    let failed = store.insert_job(NewJob::new("b1", Step::Rewrite)).await.unwrap();
    store.claim_next(&w).await.unwrap().unwrap();
    store.mark_running(failed.id, &w).await.unwrap();
    store.fail(failed.id, &w, "timeout").await.unwrap();
    assert!(matches!(
        store.retry(failed.id, "retry requested by operator").await.unwrap(),
        RetryDecision::Requeued(_)
    ));
    assert!(matches!(
        store.retry(failed.id, "again").await.unwrap(),
        RetryDecision::NotFailed(_)
    ));
    let events = store.list_events(failed.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message.as_deref(), Some("retry requested by operator"));
}

#[tokio::test]
async fn zero_attempt_job_is_a_typed_error() {
    let Some(store) = store().await else { return };
    let err = store
        .insert_job(NewJob::new("b1", Step::Validate).with_max_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidJob(_)));
    assert!(store.list_jobs(&Default::default()).await.unwrap().is_empty());
}
