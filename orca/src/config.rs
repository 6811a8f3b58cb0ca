//! Engine configuration.

use crate::errors::OrcaError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Task scheduling settings.
    #[serde(default)]
    pub task_runner: TaskRunnerConfig,
    /// Logging settings.
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, OrcaError> {
        serde_json::from_str(json).map_err(|e| OrcaError::Config(format!("invalid engine config: {e}")))
    }

    /// Reads a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OrcaError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OrcaError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }
}

/// Backoff and warning thresholds for task attempts.
///
/// Configured backoffs never shorten a task's own backoff: the runner waits
/// for the longest applicable value, capped by `max_backoff_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunnerConfig {
    /// Interval for plain (non-retryable) tasks.
    #[serde(default = "default_backoff_ms")]
    pub default_backoff_ms: u64,
    /// Minimum backoff for every retryable task.
    #[serde(default)]
    pub global_backoff_ms: Option<u64>,
    /// Minimum backoff keyed by cloud provider.
    #[serde(default)]
    pub provider_backoff_ms: HashMap<String, u64>,
    /// Minimum backoff keyed by `"<provider>.<account>"`.
    #[serde(default)]
    pub account_backoff_ms: HashMap<String, u64>,
    /// Upper bound for any backoff.
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    /// Attempts slower than this are logged as warnings.
    #[serde(default = "default_warning_invocation_time_ms")]
    pub warning_invocation_time_ms: u64,
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_warning_invocation_time_ms() -> u64 {
    30_000
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            default_backoff_ms: default_backoff_ms(),
            global_backoff_ms: None,
            provider_backoff_ms: HashMap::new(),
            account_backoff_ms: HashMap::new(),
            max_backoff_ms: None,
            warning_invocation_time_ms: default_warning_invocation_time_ms(),
        }
    }
}

impl TaskRunnerConfig {
    /// Sets the global minimum backoff.
    #[must_use]
    pub fn with_global_backoff(mut self, backoff: Duration) -> Self {
        self.global_backoff_ms = Some(duration_ms(backoff));
        self
    }

    /// Sets a per-provider minimum backoff.
    #[must_use]
    pub fn with_provider_backoff(mut self, provider: impl Into<String>, backoff: Duration) -> Self {
        self.provider_backoff_ms.insert(provider.into(), duration_ms(backoff));
        self
    }

    /// Sets a per-account minimum backoff.
    #[must_use]
    pub fn with_account_backoff(mut self, provider: &str, account: &str, backoff: Duration) -> Self {
        self.account_backoff_ms
            .insert(format!("{provider}.{account}"), duration_ms(backoff));
        self
    }

    /// Sets the backoff cap.
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff_ms = Some(duration_ms(backoff));
        self
    }

    /// Interval for plain tasks.
    #[must_use]
    pub fn default_backoff(&self) -> Duration {
        Duration::from_millis(self.default_backoff_ms)
    }

    /// Backoff cap, if any.
    #[must_use]
    pub fn max_backoff(&self) -> Option<Duration> {
        self.max_backoff_ms.map(Duration::from_millis)
    }

    /// Threshold for slow-attempt warnings.
    #[must_use]
    pub fn warning_invocation_time(&self) -> Duration {
        Duration::from_millis(self.warning_invocation_time_ms)
    }

    /// Configured minimum backoffs that apply to a provider and account.
    #[must_use]
    pub fn configured_backoffs(&self, provider: Option<&str>, account: Option<&str>) -> Vec<Duration> {
        let mut backoffs: Vec<Duration> = self.global_backoff_ms.map(Duration::from_millis).into_iter().collect();
        if let Some(provider) = provider {
            if let Some(ms) = self.provider_backoff_ms.get(provider) {
                backoffs.push(Duration::from_millis(*ms));
            }
            if let Some(ms) = account.and_then(|a| self.account_backoff_ms.get(&format!("{provider}.{a}"))) {
                backoffs.push(Duration::from_millis(*ms));
            }
        }
        backoffs
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
