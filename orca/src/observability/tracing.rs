//! Structured logging setup and span helpers.
//!
//! Log records carry `execution_id`, `stage_id`, `stage_type` and `task`
//! fields through spans, so every event emitted while a task runs can be
//! correlated without passing identifiers around.

use crate::config::TracingConfig;
use crate::errors::OrcaError;
use crate::model::{StageExecution, TaskExecution};
use ::tracing::Span;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level`. Fails if a subscriber is already set.
pub fn init_tracing(config: &TracingConfig) -> Result<(), OrcaError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| OrcaError::Config(format!("invalid log filter '{}': {e}", config.level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| OrcaError::Config(format!("tracing already initialized: {e}")))
}

/// Identifiers attached to a task attempt's span.
#[derive(Debug, Clone, Default)]
pub struct StageSpanAttributes {
    /// Execution id.
    pub execution_id: String,
    /// Stage id.
    pub stage_id: String,
    /// Stage type.
    pub stage_type: String,
    /// Task type, when the span covers one task.
    pub task: Option<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage.
    #[must_use]
    pub fn for_stage(stage: &StageExecution) -> Self {
        Self {
            execution_id: stage.execution_id.clone(),
            stage_id: stage.id.clone(),
            stage_type: stage.stage_type.clone(),
            task: None,
        }
    }

    /// Adds the task.
    #[must_use]
    pub fn with_task(mut self, task: &TaskExecution) -> Self {
        self.task = Some(task.implementing_type.clone());
        self
    }

    /// Creates an info-level span carrying the attributes.
    #[must_use]
    pub fn span(&self) -> Span {
        match &self.task {
            Some(task) => ::tracing::info_span!(
                "task",
                execution_id = %self.execution_id,
                stage_id = %self.stage_id,
                stage_type = %self.stage_type,
                task = %task,
            ),
            None => ::tracing::info_span!(
                "stage",
                execution_id = %self.execution_id,
                stage_id = %self.stage_id,
                stage_type = %self.stage_type,
            ),
        }
    }
}

/// Measures wall-clock time of one operation.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer and returns the elapsed time.
    #[must_use]
    pub fn finish(self) -> Duration {
        self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ContextMap;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("runJob");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.name(), "runJob");
        assert!(timer.finish() >= Duration::from_millis(10));
    }

    #[test]
    fn test_span_attributes() {
        let stage = StageExecution::new("exec-1", "runJob", "Run Job", ContextMap::new());
        let task = TaskExecution::new("1", "monitorJob", "monitorJob");
        let attributes = StageSpanAttributes::for_stage(&stage).with_task(&task);

        assert_eq!(attributes.execution_id, "exec-1");
        assert_eq!(attributes.task.as_deref(), Some("monitorJob"));
        let _span = attributes.span();
    }

    #[test]
    fn test_init_tracing_only_once() {
        let config = TracingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
