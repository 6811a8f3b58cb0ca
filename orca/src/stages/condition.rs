//! Holds a deployment until the conditions on its cluster clear.

use crate::core::TaskResult;
use crate::errors::TaskError;
use crate::graph::{StageDefinitionBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::services::ConditionSupplier;
use crate::tasks::{credentials_of, required_str, RetrySchedule, Task};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Context key tracking the wait state.
pub const CONDITION_STATUS: &str = "status";

/// Waits for the cluster's conditions to clear.
///
/// The stage can be skipped manually; a skipped stage finishes on its next
/// evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForConditionStage;

impl WaitForConditionStage {
    /// Stage type key.
    pub const TYPE: &'static str = "waitForCondition";
}

impl StageDefinitionBuilder for WaitForConditionStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks.with_task("evaluateCondition", EvaluateConditionTask::TYPE);
    }

    fn can_manually_skip(&self) -> bool {
        true
    }
}

/// Asks the [`ConditionSupplier`] for conditions still holding the cluster.
pub struct EvaluateConditionTask {
    conditions: Arc<dyn ConditionSupplier>,
}

impl std::fmt::Debug for EvaluateConditionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluateConditionTask").finish_non_exhaustive()
    }
}

impl EvaluateConditionTask {
    /// Task type key.
    pub const TYPE: &'static str = "evaluateCondition";

    /// Creates a new task.
    #[must_use]
    pub fn new(conditions: Arc<dyn ConditionSupplier>) -> Self {
        Self { conditions }
    }
}

#[async_trait]
impl Task for EvaluateConditionTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        if stage.context_str(CONDITION_STATUS) == Some("SKIPPED") {
            return Ok(TaskResult::succeeded());
        }

        let cluster = required_str(stage, "cluster")?;
        let region = required_str(stage, "region")?;
        let account = credentials_of(stage)
            .ok_or_else(|| TaskError::InvalidContext("missing 'credentials'".to_string()))?;

        match self.conditions.conditions(cluster, region, &account).await {
            Ok(conditions) if conditions.is_empty() => {
                debug!(stage_id = %stage.id, cluster, "No conditions remaining");
                Ok(TaskResult::succeeded().with_context_entry(CONDITION_STATUS, "SUCCEEDED"))
            }
            Ok(conditions) => {
                debug!(stage_id = %stage.id, cluster, remaining = conditions.len(), "Waiting on conditions");
                let conditions = serde_json::to_value(conditions).map_err(|e| TaskError::Other(e.into()))?;
                Ok(TaskResult::running()
                    .with_context_entry(CONDITION_STATUS, "WAITING")
                    .with_context_entry("conditions", conditions))
            }
            Err(err) => {
                warn!(stage_id = %stage.id, cluster, error = %err, "Failed to evaluate conditions");
                Ok(TaskResult::running()
                    .with_context_entry(CONDITION_STATUS, "ERROR")
                    .with_context_entry("conditions", Value::Array(Vec::new())))
            }
        }
    }

    fn retry_schedule(&self) -> Option<RetrySchedule> {
        Some(RetrySchedule::new(Duration::from_secs(30), Duration::from_secs(4 * 60 * 60)))
    }
}
