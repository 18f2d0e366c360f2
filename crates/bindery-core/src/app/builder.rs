//! AppBuilder - store / sink / registry / config のワイヤリング
//!
//! # Fail-fast 設計
//! - expect_steps() で「このプロセスが処理すべき step」を宣言
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返す（ジョブを 1 件も claim する前に落ちる）

use std::sync::Arc;

use crate::app::config::WorkerConfig;
use crate::app::registry::{ExecutorRegistry, RegistryError};
use crate::app::worker_loop::{Worker, WorkerGroup};
use crate::domain::Step;
use crate::impls::StoreEventSink;
use crate::ports::{EventSink, JobStore, StepExecutor};

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .store(store)
///     .register(Step::RenderPdf, Arc::new(PdfRenderer::new()))?
///     .expect_steps(&[Step::RenderPdf])
///     .build()?;
/// let group = app.spawn_workers();
/// ```
pub struct AppBuilder {
    store: Option<Arc<dyn JobStore>>,
    sink: Option<Arc<dyn EventSink>>,
    registry: ExecutorRegistry,
    config: WorkerConfig,
    expected_steps: Option<Vec<Step>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no job store configured")]
    MissingStore,

    #[error("Missing steps: {0:?}. These steps were expected but have no executor.")]
    MissingSteps(Vec<Step>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            sink: None,
            registry: ExecutorRegistry::new(),
            config: WorkerConfig::default(),
            expected_steps: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Event sink. Defaults to `StoreEventSink` over the configured store.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(
        mut self,
        step: impl Into<Step>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(step, executor)?;
        Ok(self)
    }

    pub fn register_with<F, E>(mut self, step: impl Into<Step>, factory: F) -> Result<Self, RegistryError>
    where
        F: Fn() -> Result<Arc<dyn StepExecutor>, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        self.registry.register_with(step, factory)?;
        Ok(self)
    }

    pub fn expect_steps(mut self, steps: &[Step]) -> Self {
        self.expected_steps = Some(steps.to_vec());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_steps {
            let missing: Vec<Step> = expected
                .iter()
                .filter(|step| !self.registry.contains(step))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingSteps(missing));
            }
        }

        let store = self.store.ok_or(BuildError::MissingStore)?;
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(StoreEventSink::new(Arc::clone(&store))));
        Ok(App {
            store,
            sink,
            registry: Arc::new(self.registry),
            config: self.config,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wired application: hands out workers sharing one store, sink and registry.
pub struct App {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn EventSink>,
    registry: Arc<ExecutorRegistry>,
    config: WorkerConfig,
}

impl App {
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registered_steps(&self) -> Vec<Step> {
        self.registry.registered_steps()
    }

    /// The `n`-th worker of this process.
    pub fn worker(&self, n: usize) -> Worker {
        Worker::new(
            self.config.worker_id_for(n),
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
    }

    /// Spawn `config.workers` workers.
    pub fn spawn_workers(&self) -> WorkerGroup {
        WorkerGroup::spawn((0..self.config.workers.max(1)).map(|n| self.worker(n)).collect())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::app::worker_loop::Tick;
    use crate::domain::{Artifacts, Job, JobStatus, NewJob, StepError, StepOutcome, WorkerId};
    use crate::impls::InMemoryJobStore;

    struct Noop;

    #[async_trait]
    impl StepExecutor for Noop {
        async fn execute(&self, _job: &Job, _worker: &WorkerId) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::done(Artifacts::new()))
        }
    }

    #[test]
    fn build_success() {
        let app = AppBuilder::new()
            .store(Arc::new(InMemoryJobStore::new()))
            .register(Step::RenderPdf, Arc::new(Noop))
            .unwrap()
            .expect_steps(&[Step::RenderPdf])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_missing_steps() {
        let app = AppBuilder::new()
            .store(Arc::new(InMemoryJobStore::new()))
            .register(Step::RenderPdf, Arc::new(Noop))
            .unwrap()
            .expect_steps(&[Step::RenderPdf, Step::Package])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingSteps(missing)) if missing == vec![Step::Package]
        ));
    }

    #[test]
    fn build_requires_a_store() {
        assert!(matches!(AppBuilder::new().build(), Err(BuildError::MissingStore)));
    }

    #[test]
    fn group_members_get_distinct_ids() {
        let app = AppBuilder::new()
            .store(Arc::new(InMemoryJobStore::new()))
            .config(WorkerConfig::default().with_worker_id("render").with_workers(2))
            .build()
            .unwrap();
        assert_ne!(app.worker(0).id(), app.worker(1).id());
    }

    #[tokio::test]
    async fn built_worker_processes_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store
            .insert_job(NewJob::new("vth-n4", Step::Assemble))
            .await
            .unwrap();
        let app = AppBuilder::new()
            .store(store.clone())
            .register_with(Step::Assemble, || Ok::<_, String>(Arc::new(Noop) as Arc<dyn StepExecutor>))
            .unwrap()
            .build()
            .unwrap();

        let mut worker = app.worker(0);
        assert!(matches!(worker.run_once().await.unwrap(), Tick::Processed(_)));
        let job = app.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        // default sink writes to the store's event log
        assert!(!store.list_events(job.id).await.unwrap().is_empty());
    }
}
