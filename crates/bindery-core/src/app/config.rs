//! WorkerConfig - worker の設定
//!
//! Plain struct + `Default` + builder methods. `from_env` reads the
//! `BINDERY_*` variables on top of the defaults.

use std::time::Duration;

use crate::domain::WorkerId;

pub const ENV_WORKER_ID: &str = "BINDERY_WORKER_ID";
pub const ENV_WORKERS: &str = "BINDERY_WORKERS";
pub const ENV_IDLE_MS: &str = "BINDERY_IDLE_MS";
pub const ENV_HEARTBEAT_MS: &str = "BINDERY_HEARTBEAT_MS";
pub const ENV_STORE_BACKOFF_MS: &str = "BINDERY_STORE_BACKOFF_MS";
pub const ENV_MAX_STORE_ERRORS: &str = "BINDERY_MAX_STORE_ERRORS";
pub const ENV_MAX_YIELDS: &str = "BINDERY_MAX_YIELDS";
pub const ENV_ERROR_MAX_LEN: &str = "BINDERY_ERROR_MAX_LEN";

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: expected {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Identity written into `worker_id` on claim.
    pub worker_id: WorkerId,
    /// Worker tasks per process (`WorkerGroup`).
    pub workers: usize,
    /// Sleep when nothing is claimable.
    pub idle_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Sleep after an iteration that hit a store error.
    pub store_backoff: Duration,
    /// Consecutive failing iterations before the loop gives up.
    pub max_consecutive_store_errors: u32,
    /// Continuations allowed within one invocation.
    pub max_yields: u32,
    /// Stored error messages are cut to this many characters.
    pub error_max_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            workers: 1,
            idle_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            store_backoff: Duration::from_secs(5),
            max_consecutive_store_errors: 10,
            max_yields: 100,
            error_max_len: 2000,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (unset or empty keys keep defaults).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(id) = get(ENV_WORKER_ID) {
            config.worker_id = WorkerId::new(id.trim());
        }
        if let Some(v) = get(ENV_WORKERS) {
            config.workers = parse(ENV_WORKERS, &v, "a positive integer")?;
            if config.workers == 0 {
                return Err(invalid(ENV_WORKERS, &v, "a positive integer"));
            }
        }
        if let Some(v) = get(ENV_IDLE_MS) {
            config.idle_interval = millis(ENV_IDLE_MS, &v)?;
        }
        if let Some(v) = get(ENV_HEARTBEAT_MS) {
            config.heartbeat_interval = millis(ENV_HEARTBEAT_MS, &v)?;
            if config.heartbeat_interval.is_zero() {
                return Err(invalid(ENV_HEARTBEAT_MS, &v, "a non-zero duration in ms"));
            }
        }
        if let Some(v) = get(ENV_STORE_BACKOFF_MS) {
            config.store_backoff = millis(ENV_STORE_BACKOFF_MS, &v)?;
        }
        if let Some(v) = get(ENV_MAX_STORE_ERRORS) {
            config.max_consecutive_store_errors = parse(ENV_MAX_STORE_ERRORS, &v, "an integer")?;
        }
        if let Some(v) = get(ENV_MAX_YIELDS) {
            config.max_yields = parse(ENV_MAX_YIELDS, &v, "an integer")?;
        }
        if let Some(v) = get(ENV_ERROR_MAX_LEN) {
            config.error_max_len = parse(ENV_ERROR_MAX_LEN, &v, "an integer")?;
        }
        Ok(config)
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = WorkerId::new(id);
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn with_idle_interval(mut self, d: Duration) -> Self {
        self.idle_interval = d;
        self
    }

    /// Clamped to at least 1ms (`tokio::time::interval` rejects zero).
    pub fn with_heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    pub fn with_store_backoff(mut self, d: Duration) -> Self {
        self.store_backoff = d;
        self
    }

    pub fn with_max_consecutive_store_errors(mut self, n: u32) -> Self {
        self.max_consecutive_store_errors = n;
        self
    }

    pub fn with_max_yields(mut self, n: u32) -> Self {
        self.max_yields = n;
        self
    }

    pub fn with_error_max_len(mut self, n: usize) -> Self {
        self.error_max_len = n;
        self
    }

    /// Identity of the `n`-th worker in a group.
    ///
    /// A group of one keeps the configured id; larger groups suffix `-<n>`.
    pub fn worker_id_for(&self, n: usize) -> WorkerId {
        if self.workers <= 1 {
            self.worker_id.clone()
        } else {
            WorkerId::new(format!("{}-{n}", self.worker_id))
        }
    }
}

/// `<hostname>-<pid>`
pub fn default_worker_id() -> WorkerId {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    WorkerId::new(format!("{host}-{}", std::process::id()))
}

fn invalid(key: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        expected,
    }
}

fn parse<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value, expected))
}

fn millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value, "a duration in ms").map(Duration::from_millis)
}
