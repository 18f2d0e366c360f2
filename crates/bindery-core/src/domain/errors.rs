//! Errors - エラー型と分類

use thiserror::Error;

use super::ids::JobId;

/// Operational classification of an executor error.
///
/// - Transient: 一時的なエラー（attempts が残っていれば自動で retry）
/// - Permanent: 恒久的なエラー（retry しても無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Failure reported by a step executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepError {
    kind: ErrorKind,
    message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Job store failure (connectivity, decoding, referential integrity).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("failed to decode stored row: {0}")]
    Decode(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_displays_message_only() {
        let err = StepError::transient("LLM endpoint timed out");
        assert_eq!(err.to_string(), "LLM endpoint timed out");
        assert!(err.is_transient());
        assert_eq!(StepError::permanent("bad input").kind(), ErrorKind::Permanent);
    }
}
