//! The task contract.
//!
//! A [`Task`] is a stateless strategy invoked once per attempt. Plain tasks
//! are re-invoked on a fixed default interval while they report RUNNING.
//! Tasks that return a [`RetrySchedule`] control their own backoff and
//! timeout, and may let an ancestor stage's `stageTimeoutMs` override the
//! timeout.

mod resolver;

pub use resolver::TaskResolver;

use crate::core::TaskResult;
use crate::errors::TaskError;
use crate::model::{context_keys, StageExecution};
use async_trait::async_trait;
use std::time::Duration;

/// Backoff and timeout of a retryable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Wait between attempts that report RUNNING.
    pub backoff_period: Duration,
    /// Maximum time since the task started.
    pub timeout: Duration,
    /// Whether an ancestor's `stageTimeoutMs` replaces `timeout`.
    pub timeout_overridable: bool,
}

impl RetrySchedule {
    /// Creates a schedule with a fixed timeout.
    #[must_use]
    pub const fn new(backoff_period: Duration, timeout: Duration) -> Self {
        Self {
            backoff_period,
            timeout,
            timeout_overridable: false,
        }
    }

    /// Lets a stage-level timeout replace this schedule's timeout.
    #[must_use]
    pub const fn overridable(mut self) -> Self {
        self.timeout_overridable = true;
        self
    }
}

/// A unit of work within a stage.
#[async_trait]
pub trait Task: Send + Sync {
    /// The key stages use to reference this task.
    fn task_type(&self) -> &str;

    /// Runs one attempt against the stage's merged context.
    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError>;

    /// Backoff and timeout for retryable tasks; `None` for plain tasks.
    fn retry_schedule(&self) -> Option<RetrySchedule> {
        None
    }

    /// Backoff before the next attempt, given time since the task started.
    ///
    /// Defaults to the stage's `backoffPeriodMs`, else the schedule's backoff.
    fn dynamic_backoff_period(&self, stage: &StageExecution, _elapsed: Duration) -> Option<Duration> {
        let schedule = self.retry_schedule()?;
        Some(stage.backoff_period().unwrap_or(schedule.backoff_period))
    }

    /// Timeout for this stage; defaults to the schedule's timeout.
    fn dynamic_timeout(&self, _stage: &StageExecution) -> Option<Duration> {
        self.retry_schedule().map(|s| s.timeout)
    }

    /// Called once when the task times out.
    ///
    /// Only TERMINAL and FAILED_CONTINUE results are honored.
    async fn on_timeout(&self, _stage: &StageExecution) -> Option<TaskResult> {
        None
    }

    /// Called when the execution is canceled while this task is running.
    ///
    /// May be called more than once and must tolerate having nothing to do.
    async fn on_cancel(&self, _stage: &StageExecution) -> Option<TaskResult> {
        None
    }

    /// Whether configured per-provider and per-account backoffs apply.
    fn is_cloud_provider_aware(&self) -> bool {
        false
    }
}

/// Cloud provider named by the stage context, defaulting to `aws`.
#[must_use]
pub fn cloud_provider_of(stage: &StageExecution) -> String {
    stage
        .context_str(context_keys::CLOUD_PROVIDER)
        .or_else(|| stage.context_str("providerType"))
        .unwrap_or("aws")
        .to_string()
}

/// Account named by the stage context.
#[must_use]
pub fn credentials_of(stage: &StageExecution) -> Option<String> {
    stage
        .context_str(context_keys::CREDENTIALS)
        .or_else(|| stage.context_str("account"))
        .map(str::to_string)
}

/// Fetches a required string from the stage context.
pub fn required_str<'a>(stage: &'a StageExecution, key: &str) -> Result<&'a str, TaskError> {
    stage
        .context_str(key)
        .ok_or_else(|| TaskError::InvalidContext(format!("missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ContextMap;

    struct Poll;

    #[async_trait]
    impl Task for Poll {
        fn task_type(&self) -> &str {
            "poll"
        }

        async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskError> {
            Ok(TaskResult::running())
        }

        fn retry_schedule(&self) -> Option<RetrySchedule> {
            Some(RetrySchedule::new(Duration::from_secs(5), Duration::from_secs(60)).overridable())
        }
    }

    struct Plain;

    #[async_trait]
    impl Task for Plain {
        fn task_type(&self) -> &str {
            "plain"
        }

        async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskError> {
            Ok(TaskResult::succeeded())
        }
    }

    fn stage() -> StageExecution {
        StageExecution::new("exec", "wait", "Wait", ContextMap::new())
    }

    #[test]
    fn test_dynamic_defaults() {
        let s = stage();
        assert_eq!(Poll.dynamic_backoff_period(&s, Duration::ZERO), Some(Duration::from_secs(5)));
        assert_eq!(Poll.dynamic_timeout(&s), Some(Duration::from_secs(60)));
        assert!(Poll.retry_schedule().unwrap().timeout_overridable);

        assert_eq!(Plain.dynamic_backoff_period(&s, Duration::ZERO), None);
        assert_eq!(Plain.dynamic_timeout(&s), None);
    }

    #[test]
    fn test_stage_backoff_override() {
        let s = stage().with_context_entry("backoffPeriodMs", 250);
        assert_eq!(Poll.dynamic_backoff_period(&s, Duration::ZERO), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_provider_and_credentials() {
        assert_eq!(cloud_provider_of(&stage()), "aws");
        let s = stage()
            .with_context_entry("cloudProvider", "kubernetes")
            .with_context_entry("account", "prod");
        assert_eq!(cloud_provider_of(&s), "kubernetes");
        assert_eq!(credentials_of(&s).as_deref(), Some("prod"));
    }

    #[tokio::test]
    async fn test_default_hooks_return_none() {
        assert!(Plain.on_cancel(&stage()).await.is_none());
        assert!(Plain.on_timeout(&stage()).await.is_none());
        assert!(required_str(&stage(), "cluster").is_err());
    }
}
