//! Waits a fixed number of seconds.

use crate::core::TaskResult;
use crate::errors::{GraphValidationError, TaskError};
use crate::graph::{StageDefinitionBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::runner::Clock;
use crate::tasks::{RetrySchedule, Task};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const WAIT_TIME: &str = "waitTime";
const SKIP_REMAINING_WAIT: &str = "skipRemainingWait";

fn wait_time_of(stage: &StageExecution) -> Option<Duration> {
    match stage.context.get(WAIT_TIME)? {
        Value::String(s) => s.trim().parse::<u64>().ok().map(Duration::from_secs),
        value => value.as_u64().map(Duration::from_secs),
    }
}

/// Pauses the branch for `waitTime` seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitStage;

impl WaitStage {
    /// Stage type key.
    pub const TYPE: &'static str = "wait";
}

impl StageDefinitionBuilder for WaitStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn validate(&self, stage: &StageExecution) -> Result<(), GraphValidationError> {
        match stage.context.get(WAIT_TIME) {
            None => Err(GraphValidationError::missing_context(Self::TYPE, WAIT_TIME).with_stages(vec![stage.id.clone()])),
            // expressions are resolved when the stage is planned
            Some(Value::String(s)) if s.contains("${") => Ok(()),
            Some(_) if wait_time_of(stage).is_some() => Ok(()),
            Some(_) => Err(GraphValidationError::new(format!(
                "Stage {} has an invalid '{WAIT_TIME}'",
                stage.id
            ))
            .with_stages(vec![stage.id.clone()])
            .with_code("GRAPH-INVALID-CONTEXT")),
        }
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks.with_task("wait", WaitTask::TYPE);
    }

    fn can_manually_skip(&self) -> bool {
        true
    }
}

/// Re-checks the elapsed time on every attempt.
///
/// Setting `skipRemainingWait` ends the wait on the next attempt.
pub struct WaitTask {
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WaitTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitTask").finish_non_exhaustive()
    }
}

impl WaitTask {
    /// Task type key.
    pub const TYPE: &'static str = "wait";

    /// Creates a new task reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Task for WaitTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let wait_time = wait_time_of(stage)
            .ok_or_else(|| TaskError::InvalidContext(format!("missing or invalid '{WAIT_TIME}'")))?;
        if stage.context_bool(SKIP_REMAINING_WAIT) == Some(true) {
            return Ok(TaskResult::succeeded());
        }

        let start = stage.start_time.unwrap_or_else(|| self.clock.now_millis());
        let elapsed = u64::try_from(self.clock.now_millis() - start).unwrap_or(0);
        if Duration::from_millis(elapsed) >= wait_time {
            Ok(TaskResult::succeeded())
        } else {
            Ok(TaskResult::running())
        }
    }

    fn retry_schedule(&self) -> Option<RetrySchedule> {
        Some(RetrySchedule::new(Duration::from_secs(1), Duration::MAX))
    }

    fn dynamic_backoff_period(&self, stage: &StageExecution, elapsed: Duration) -> Option<Duration> {
        let backoff = stage.backoff_period().unwrap_or(Duration::from_secs(1));
        let remaining = wait_time_of(stage)?.saturating_sub(elapsed);
        Some(backoff.min(remaining).max(Duration::from_millis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::runner::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stage(context: Value, started_at: i64) -> StageExecution {
        let Value::Object(context) = context else {
            panic!("object expected");
        };
        let mut stage = StageExecution::new("exec", WaitStage::TYPE, "Wait", context);
        stage.start(started_at);
        stage
    }

    #[tokio::test]
    async fn test_waits_until_elapsed() {
        let clock = Arc::new(ManualClock::new(10_000));
        let task = WaitTask::new(clock.clone());
        let stage = stage(json!({"waitTime": 5}), 10_000);

        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Running);
        clock.advance(Duration::from_millis(4_999));
        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Running);
        clock.advance(Duration::from_millis(1));
        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_skip_remaining_wait() {
        let task = WaitTask::new(Arc::new(ManualClock::new(0)));
        let stage = stage(json!({"waitTime": "600", "skipRemainingWait": true}), 0);

        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_backoff_never_overshoots() {
        let task = WaitTask::new(Arc::new(ManualClock::new(0)));
        let stage = stage(json!({"waitTime": 3}), 0);

        assert_eq!(
            task.dynamic_backoff_period(&stage, Duration::from_millis(500)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            task.dynamic_backoff_period(&stage, Duration::from_millis(2_750)),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_validate() {
        assert!(WaitStage.validate(&stage(json!({"waitTime": 30}), 0)).is_ok());
        assert!(WaitStage.validate(&stage(json!({"waitTime": "${delay}"}), 0)).is_ok());
        assert!(WaitStage.validate(&stage(json!({"waitTime": "soon"}), 0)).is_err());
        assert!(WaitStage.validate(&stage(json!({}), 0)).is_err());
    }
}
