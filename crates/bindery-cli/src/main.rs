//! bindery - worker process and inspection tool for the book job queue.

mod args;
mod command;

use std::sync::Arc;

use anyhow::Context;

use bindery_core::app::{AppBuilder, WorkerConfig};
use bindery_core::domain::{Job, JobId, Plan, Step};
use bindery_core::ports::{IdGenerator, JobStore, RetryDecision, SystemClock, UlidGenerator};
use bindery_pg::PostgresJobStore;

use crate::args::{Command, USAGE};
use crate::command::{STEP_ENV_PREFIX, executors_from_vars, utf8_vars};

const ENV_DATABASE_URL: &str = "DATABASE_URL";
const OPERATOR_RETRY: &str = "retry requested by operator";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bindery_core::observability::init();

    let command = args::parse(std::env::args().skip(1))?;
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let url = std::env::var(ENV_DATABASE_URL)
        .with_context(|| format!("{ENV_DATABASE_URL} is not set"))?;
    let store = PostgresJobStore::connect(&url)
        .await
        .context("failed to connect to PostgreSQL")?;

    match command {
        Command::Help => {}
        Command::Migrate => {
            store.migrate().await.context("migration failed")?;
            println!("migrations applied");
        }
        Command::Worker { workers, expect } => run_workers(store, workers, &expect).await?,
        Command::Enqueue { plan } => enqueue(&store, &plan).await?,
        Command::List(filter) => {
            let jobs = store.list_jobs(&filter).await?;
            print_table(&jobs);
        }
        Command::Show(id) => {
            let job = require_job(&store, id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Events(id) => {
            require_job(&store, id).await?;
            let events = store.list_events(id).await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Command::Cancel(id) => {
            if store.cancel(id).await? {
                println!("{id} cancelled");
            } else {
                println!("{id} is already finished; nothing to cancel");
            }
        }
        Command::Retry(id) => match store.retry(id, OPERATOR_RETRY).await? {
            RetryDecision::Requeued(job) => {
                println!("{id} requeued (attempt {}/{})", job.attempts + 1, job.max_attempts)
            }
            RetryDecision::Exhausted(job) => anyhow::bail!(
                "{id} has used all {} attempts; it stays failed",
                job.max_attempts
            ),
            RetryDecision::NotFailed(job) => {
                anyhow::bail!("{id} is {}, only failed jobs can be retried", job.status)
            }
        },
        Command::Delete(id) => {
            if store.delete_job(id).await? {
                println!("{id} deleted");
            } else {
                anyhow::bail!("job not found: {id}");
            }
        }
        Command::Status => {
            let counts = store.counts_by_status().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }
    Ok(())
}

async fn run_workers(
    store: PostgresJobStore,
    workers: Option<usize>,
    expect: &[Step],
) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_env()?;
    if let Some(n) = workers {
        config = config.with_workers(n);
    }

    let bindings = executors_from_vars(utf8_vars(std::env::vars_os()));
    if bindings.is_empty() {
        anyhow::bail!("no steps bound; set {STEP_ENV_PREFIX}<STEP>=<program> for each step");
    }

    let mut builder = AppBuilder::new().store(Arc::new(store)).config(config);
    for (step, executor) in bindings {
        tracing::info!(step = %step, program = executor.program(), "step bound");
        builder = builder.register(step, Arc::new(executor))?;
    }
    if !expect.is_empty() {
        builder = builder.expect_steps(expect);
    }
    let app = builder.build()?;

    let group = app.spawn_workers();
    tracing::info!(workers = group.len(), steps = ?app.registered_steps(), "workers started");

    let shutdown = group.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, finishing in-flight jobs");
            shutdown.request();
        }
    });

    let stats = group.join().await?;
    tracing::info!(
        processed = stats.processed,
        done = stats.done,
        failed = stats.failed,
        retried = stats.retried,
        yielded = stats.yielded,
        "workers stopped"
    );
    Ok(())
}

async fn enqueue(store: &PostgresJobStore, path: &std::path::Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let plan: Plan = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid plan", path.display()))?;

    let ids = UlidGenerator::new(SystemClock);
    let resolved = plan.resolve(|| ids.generate_job_id())?;
    let inserted = store.insert_jobs(resolved.jobs).await?;

    let mut keys: Vec<(&String, &JobId)> = resolved.ids.iter().collect();
    keys.sort_by_key(|(_, id)| **id);
    for (key, id) in keys {
        println!("{key}\t{id}");
    }
    tracing::info!(jobs = inserted.len(), "plan enqueued");
    Ok(())
}

async fn require_job(store: &PostgresJobStore, id: JobId) -> anyhow::Result<Job> {
    store
        .get_job(id)
        .await?
        .with_context(|| format!("job not found: {id}"))
}

fn print_table(jobs: &[Job]) {
    println!(
        "{:<31} {:<16} {:<15} {:<9} {:>4} {:>8}  {}",
        "ID", "BOOK", "STEP", "STATUS", "PRI", "ATTEMPTS", "WORKER"
    );
    for job in jobs {
        println!(
            "{:<31} {:<16} {:<15} {:<9} {:>4} {:>8}  {}",
            job.id.to_string(),
            job.book_id,
            job.step.as_str(),
            job.status.as_str(),
            job.priority,
            format!("{}/{}", job.attempts, job.max_attempts),
            job.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("-"),
        );
    }
}
