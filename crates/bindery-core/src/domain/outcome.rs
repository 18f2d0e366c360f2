//! Outcome model: what a step executor reports back.
//!
//! Failures are not an outcome variant; executors return `Err(StepError)`.

use serde::{Deserialize, Serialize};

use super::job::Artifacts;

/// Result of one executor invocation.
///
/// - `Done`: the step finished; `outputs` become the job's output artifacts.
/// - `Yield`: more work remains. `next_inputs` replace the job's input
///   artifacts and the next invocation starts from them (the continuation
///   state lives there, not in the executor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Done {
        #[serde(default)]
        outputs: Artifacts,
    },
    Yield {
        #[serde(default)]
        next_inputs: Artifacts,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl StepOutcome {
    pub fn done(outputs: Artifacts) -> Self {
        StepOutcome::Done { outputs }
    }

    pub fn yield_with(next_inputs: Artifacts) -> Self {
        StepOutcome::Yield {
            next_inputs,
            progress: None,
            message: None,
        }
    }

    /// Set progress on a `Yield` (no-op on `Done`).
    pub fn with_progress(mut self, value: u8) -> Self {
        if let StepOutcome::Yield { progress, .. } = &mut self {
            *progress = Some(value.min(100));
        }
        self
    }

    /// Set the message on a `Yield` (no-op on `Done`).
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        if let StepOutcome::Yield { message, .. } = &mut self {
            *message = Some(text.into());
        }
        self
    }

    pub fn is_yield(&self) -> bool {
        matches!(self, StepOutcome::Yield { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_tagged_by_status() {
        let done = StepOutcome::done(Artifacts::from([("pdf".into(), "out/book.pdf".into())]));
        let v = serde_json::to_value(&done).unwrap();
        assert_eq!(v["status"], "done");
        assert_eq!(v["outputs"]["pdf"], "out/book.pdf");
    }

    #[test]
    fn yield_parses_from_executor_json() {
        let json = r#"{"status":"yield","next_inputs":{"page":"12"},"progress":40}"#;
        let outcome: StepOutcome = serde_json::from_str(json).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::yield_with(Artifacts::from([("page".into(), "12".into())])).with_progress(40)
        );
    }

    #[test]
    fn progress_builder_ignores_done() {
        let done = StepOutcome::done(Artifacts::new()).with_progress(50).with_message("x");
        assert_eq!(done, StepOutcome::done(Artifacts::new()));
        assert!(!done.is_yield());
    }
}
