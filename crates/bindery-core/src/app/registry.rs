//! ExecutorRegistry - step → StepExecutor の対応表
//!
//! Executors are registered either as ready instances or as factories.
//! A factory runs on the first `resolve` for its step and the result is
//! cached for the life of the process. A failing factory leaves the cell
//! empty, so the next `resolve` tries again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::domain::Step;
use crate::ports::StepExecutor;

type ExecutorFactory =
    Box<dyn Fn() -> Result<Arc<dyn StepExecutor>, String> + Send + Sync + 'static>;

struct Entry {
    factory: Option<ExecutorFactory>,
    executor: OnceCell<Arc<dyn StepExecutor>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("executor for step '{0}' is already registered")]
    AlreadyRegistered(Step),

    #[error("no executor registered for step '{0}'")]
    NotFound(Step),

    #[error("failed to resolve executor for step '{step}': {reason}")]
    Resolution { step: Step, reason: String },
}

#[derive(Default)]
pub struct ExecutorRegistry {
    entries: HashMap<Step, Entry>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready executor instance.
    pub fn register(
        &mut self,
        step: impl Into<Step>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<(), RegistryError> {
        self.insert(
            step.into(),
            Entry {
                factory: None,
                executor: OnceCell::from(executor),
            },
        )
    }

    /// Register a factory, run lazily on first resolve.
    pub fn register_with<F, E>(&mut self, step: impl Into<Step>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Result<Arc<dyn StepExecutor>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let factory: ExecutorFactory = Box::new(move || factory().map_err(|e| e.to_string()));
        self.insert(
            step.into(),
            Entry {
                factory: Some(factory),
                executor: OnceCell::new(),
            },
        )
    }

    fn insert(&mut self, step: Step, entry: Entry) -> Result<(), RegistryError> {
        if self.entries.contains_key(&step) {
            return Err(RegistryError::AlreadyRegistered(step));
        }
        self.entries.insert(step, entry);
        Ok(())
    }

    pub fn contains(&self, step: &Step) -> bool {
        self.entries.contains_key(step)
    }

    /// Registered steps, sorted by name.
    pub fn registered_steps(&self) -> Vec<Step> {
        let mut steps: Vec<Step> = self.entries.keys().cloned().collect();
        steps.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        steps
    }

    pub async fn resolve(&self, step: &Step) -> Result<Arc<dyn StepExecutor>, RegistryError> {
        let entry = self
            .entries
            .get(step)
            .ok_or_else(|| RegistryError::NotFound(step.clone()))?;

        let executor = entry
            .executor
            .get_or_try_init(|| async {
                let factory = entry.factory.as_ref().ok_or_else(|| RegistryError::Resolution {
                    step: step.clone(),
                    reason: "no factory".to_string(),
                })?;
                let executor = factory().map_err(|reason| RegistryError::Resolution {
                    step: step.clone(),
                    reason,
                })?;
                tracing::debug!(step = %step, "executor resolved");
                Ok::<_, RegistryError>(executor)
            })
            .await?;
        Ok(Arc::clone(executor))
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("steps", &self.registered_steps())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::{Artifacts, Job, StepError, StepOutcome, WorkerId};

    struct Noop;

    #[async_trait]
    impl StepExecutor for Noop {
        async fn execute(&self, _job: &Job, _worker: &WorkerId) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::done(Artifacts::new()))
        }
    }

    #[tokio::test]
    async fn register_then_resolve() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Step::RenderPdf, Arc::new(Noop)).unwrap();
        assert!(registry.resolve(&Step::RenderPdf).await.is_ok());
        assert!(registry.contains(&Step::RenderPdf));
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Step::Rewrite, Arc::new(Noop)).unwrap();
        let err = registry
            .register_with(Step::Rewrite, || Ok::<_, String>(Arc::new(Noop) as Arc<dyn StepExecutor>))
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered(Step::Rewrite));
    }

    #[tokio::test]
    async fn unknown_step_is_not_found() {
        let registry = ExecutorRegistry::new();
        let step = Step::from("translate");
        assert!(matches!(
            registry.resolve(&step).await,
            Err(RegistryError::NotFound(s)) if s == step
        ));
    }

    #[tokio::test]
    async fn factory_runs_once_and_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = ExecutorRegistry::new();
        registry
            .register_with(Step::Assemble, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(Arc::new(Noop) as Arc<dyn StepExecutor>)
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let a = registry.resolve(&Step::Assemble).await.unwrap();
        let b = registry.resolve(&Step::Assemble).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_factory_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = ExecutorRegistry::new();
        registry
            .register_with(Step::RenderHtml, move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("template directory missing".to_string())
                } else {
                    Ok(Arc::new(Noop) as Arc<dyn StepExecutor>)
                }
            })
            .unwrap();

        let err = registry.resolve(&Step::RenderHtml).await.err().unwrap();
        assert!(matches!(err, RegistryError::Resolution { ref reason, .. } if reason == "template directory missing"));
        assert!(registry.resolve(&Step::RenderHtml).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registered_steps_are_sorted() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Step::Validate, Arc::new(Noop)).unwrap();
        registry.register(Step::Assemble, Arc::new(Noop)).unwrap();
        registry.register("translate", Arc::new(Noop)).unwrap();
        assert_eq!(
            registry.registered_steps(),
            vec![Step::Assemble, Step::from("translate"), Step::Validate]
        );
    }
}
