//! Cluster-wide operations: shrinking and disabling clusters.

use crate::core::{ContextMap, TaskResult};
use crate::errors::{OrcaError, TaskError};
use crate::graph::{StageDefinitionBuilder, StageGraphBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::services::KatoService;
use crate::tasks::{cloud_provider_of, credentials_of, required_str, RetrySchedule, Task};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Context key holding the id of the last submitted kato operation.
pub const LAST_KATO_TASK_ID: &str = "kato.last.task.id";

/// Shrinks a cluster down to `shrinkToSize` server groups.
///
/// When active server groups may be deleted, the cluster is first disabled
/// down to the same size unless `runDisableClusterStep` is false.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShrinkClusterStage;

impl ShrinkClusterStage {
    /// Stage type key.
    pub const TYPE: &'static str = "shrinkCluster";
}

#[async_trait]
impl StageDefinitionBuilder for ShrinkClusterStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks
            .with_task("shrinkCluster", ClusterOperationTask::SHRINK)
            .with_task("monitorShrinkCluster", MonitorKatoTask::TYPE);
    }

    async fn before_stages(&self, stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
        let allow_delete_active = stage.context_bool("allowDeleteActive") == Some(true);
        let run_disable_step = stage.context_bool("runDisableClusterStep") != Some(false);
        if !(allow_delete_active && run_disable_step) {
            return Ok(());
        }

        let shrink_to_size = stage.context.get("shrinkToSize").cloned().unwrap_or(Value::Null);
        let mut context = stage.context.clone();
        context.insert(
            "continueIfClusterNotFound".to_string(),
            Value::Bool(stage.context_u64("shrinkToSize") == Some(0)),
        );
        context.insert("remainingEnabledServerGroups".to_string(), shrink_to_size);
        context.insert(
            "preferLargerOverNewer".to_string(),
            stage.context.get("retainLargerOverNewer").cloned().unwrap_or(Value::Null),
        );

        debug!(stage_id = %stage.id, "Disabling cluster before shrinking");
        graph.add(|s| {
            s.stage_type = DisableClusterStage::TYPE.to_string();
            s.name = "disableCluster".to_string();
            s.context = context;
        });
        Ok(())
    }
}

/// Disables all but `remainingEnabledServerGroups` server groups of a cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableClusterStage;

impl DisableClusterStage {
    /// Stage type key.
    pub const TYPE: &'static str = "disableCluster";
}

impl StageDefinitionBuilder for DisableClusterStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks
            .with_task("disableCluster", ClusterOperationTask::DISABLE)
            .with_task("monitorDisableCluster", MonitorKatoTask::TYPE);
    }
}

/// Submits a cluster-wide operation built from the stage context.
pub struct ClusterOperationTask {
    kato: Arc<dyn KatoService>,
    task_type: &'static str,
    fields: &'static [&'static str],
}

impl std::fmt::Debug for ClusterOperationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterOperationTask")
            .field("task_type", &self.task_type)
            .finish_non_exhaustive()
    }
}

impl ClusterOperationTask {
    /// Task type of the shrink operation.
    pub const SHRINK: &'static str = "shrinkCluster";
    /// Task type of the disable operation.
    pub const DISABLE: &'static str = "disableCluster";

    /// Creates the shrink task.
    #[must_use]
    pub fn shrink(kato: Arc<dyn KatoService>) -> Self {
        Self {
            kato,
            task_type: Self::SHRINK,
            fields: &["shrinkToSize", "allowDeleteActive", "retainLargerOverNewer"],
        }
    }

    /// Creates the disable task.
    #[must_use]
    pub fn disable(kato: Arc<dyn KatoService>) -> Self {
        Self {
            kato,
            task_type: Self::DISABLE,
            fields: &[
                "remainingEnabledServerGroups",
                "preferLargerOverNewer",
                "continueIfClusterNotFound",
            ],
        }
    }

    fn operation(&self, stage: &StageExecution) -> Result<Value, TaskError> {
        let cluster = required_str(stage, "cluster")?;
        let account = credentials_of(stage)
            .ok_or_else(|| TaskError::InvalidContext("missing 'credentials'".to_string()))?;

        let mut body = ContextMap::new();
        body.insert("cluster".to_string(), json!(cluster));
        body.insert("credentials".to_string(), json!(account));
        body.insert("cloudProvider".to_string(), json!(cloud_provider_of(stage)));
        if let Some(regions) = stage.context.get("regions") {
            body.insert("regions".to_string(), regions.clone());
        } else if let Some(region) = stage.context.get("region") {
            body.insert("regions".to_string(), json!([region]));
        }
        for field in self.fields {
            if let Some(value) = stage.context.get(*field) {
                body.insert((*field).to_string(), value.clone());
            }
        }
        Ok(json!({ self.task_type: body }))
    }
}

#[async_trait]
impl Task for ClusterOperationTask {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let operation = self.operation(stage)?;
        let task_id = self
            .kato
            .submit_operation(&cloud_provider_of(stage), operation)
            .await?;
        info!(task_id = %task_id, operation = self.task_type, "Submitted cluster operation");

        Ok(TaskResult::succeeded()
            .with_context_entry("notification.type", self.task_type.to_lowercase())
            .with_context_entry(LAST_KATO_TASK_ID, task_id))
    }

    fn retry_schedule(&self) -> Option<RetrySchedule> {
        Some(RetrySchedule::new(Duration::from_secs(10), Duration::from_secs(300)))
    }

    fn is_cloud_provider_aware(&self) -> bool {
        true
    }
}

/// Polls the last submitted kato operation until it finishes.
pub struct MonitorKatoTask {
    kato: Arc<dyn KatoService>,
}

impl std::fmt::Debug for MonitorKatoTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorKatoTask").finish_non_exhaustive()
    }
}

impl MonitorKatoTask {
    /// Task type key.
    pub const TYPE: &'static str = "monitorKato";

    /// Creates a new monitor task.
    #[must_use]
    pub fn new(kato: Arc<dyn KatoService>) -> Self {
        Self { kato }
    }
}

#[async_trait]
impl Task for MonitorKatoTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let task_id = required_str(stage, LAST_KATO_TASK_ID)?;
        let status = match self.kato.operation_status(task_id).await {
            Ok(status) => status,
            // Freshly submitted operations can take a moment to show up.
            Err(err) if err.is_not_found() => return Ok(TaskResult::running()),
            Err(err) => return Err(err.into()),
        };

        if status.failed {
            let message = status
                .message
                .unwrap_or_else(|| format!("Operation {task_id} failed"));
            return Ok(TaskResult::terminal().with_context_entry(
                "exception",
                json!({
                    "exceptionType": "KatoOperationFailed",
                    "details": { "error": message },
                    "shouldRetry": false,
                }),
            ));
        }
        if status.completed {
            return Ok(TaskResult::succeeded().with_output("kato.task.completed", task_id));
        }
        Ok(TaskResult::running())
    }

    fn retry_schedule(&self) -> Option<RetrySchedule> {
        Some(RetrySchedule::new(Duration::from_secs(5), Duration::from_secs(3600)))
    }

    fn is_cloud_provider_aware(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use crate::services::{MockKatoService, OperationStatus};
    use crate::core::ExecutionStatus;
    use pretty_assertions::assert_eq;

    fn shrink_stage(context: Value) -> StageExecution {
        let Value::Object(context) = context else {
            panic!("object expected");
        };
        StageExecution::new("exec", ShrinkClusterStage::TYPE, "Shrink", context).with_ref_id("1")
    }

    async fn before_stages(context: Value) -> Vec<StageExecution> {
        let stage = shrink_stage(context);
        let mut graph = StageGraphBuilder::before_stages(&stage);
        ShrinkClusterStage.before_stages(&stage, &mut graph).await.unwrap();
        graph.build().collect()
    }

    #[tokio::test]
    async fn test_disable_injected_when_delete_active_allowed() {
        let stages = before_stages(json!({
            "allowDeleteActive": true,
            "runDisableClusterStep": true,
            "shrinkToSize": 0,
            "retainLargerOverNewer": true,
            "cluster": "app-main",
        }))
        .await;

        assert_eq!(stages.len(), 1);
        let disable = &stages[0];
        assert_eq!(disable.name, "disableCluster");
        assert_eq!(disable.stage_type, "disableCluster");
        assert_eq!(disable.ref_id.as_deref(), Some("1<1"));
        assert_eq!(disable.context["remainingEnabledServerGroups"], json!(0));
        assert_eq!(disable.context["preferLargerOverNewer"], json!(true));
        assert_eq!(disable.context["continueIfClusterNotFound"], json!(true));
        assert_eq!(disable.context["cluster"], json!("app-main"));
    }

    #[tokio::test]
    async fn test_disable_matrix() {
        let cases = [
            (json!({"allowDeleteActive": true}), 1),
            (json!({"allowDeleteActive": true, "runDisableClusterStep": true}), 1),
            (json!({"allowDeleteActive": true, "runDisableClusterStep": false}), 0),
            (json!({"allowDeleteActive": false, "runDisableClusterStep": true}), 0),
            (json!({"allowDeleteActive": false, "runDisableClusterStep": false}), 0),
            (json!({"runDisableClusterStep": true}), 0),
        ];
        for (context, expected) in cases {
            let label = context.to_string();
            assert_eq!(before_stages(context).await.len(), expected, "{label}");
        }
    }

    #[tokio::test]
    async fn test_continue_if_not_found_only_when_shrinking_to_zero() {
        let stages = before_stages(json!({"allowDeleteActive": true, "shrinkToSize": 2})).await;
        assert_eq!(stages[0].context["continueIfClusterNotFound"], json!(false));
        assert_eq!(stages[0].context["remainingEnabledServerGroups"], json!(2));
    }

    #[test]
    fn test_task_graph() {
        let stage = shrink_stage(json!({}));
        let mut tasks = TaskGraphBuilder::new();
        ShrinkClusterStage.task_graph(&stage, &mut tasks);
        let types: Vec<String> = tasks.build().into_iter().map(|t| t.implementing_type).collect();
        assert_eq!(types, vec!["shrinkCluster", "monitorKato"]);
    }

    #[tokio::test]
    async fn test_shrink_submits_operation() {
        let mut kato = MockKatoService::new();
        kato.expect_submit_operation()
            .withf(|provider, operation| {
                provider == "aws"
                    && operation["shrinkCluster"]["cluster"] == json!("app-main")
                    && operation["shrinkCluster"]["regions"] == json!(["us-east-1"])
                    && operation["shrinkCluster"]["shrinkToSize"] == json!(1)
            })
            .times(1)
            .returning(|_, _| Ok("42".to_string()));
        let task = ClusterOperationTask::shrink(Arc::new(kato));
        let stage = shrink_stage(json!({
            "cluster": "app-main",
            "credentials": "prod",
            "region": "us-east-1",
            "shrinkToSize": 1,
        }));

        let result = task.execute(&stage).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.context[LAST_KATO_TASK_ID], json!("42"));
    }

    #[tokio::test]
    async fn test_shrink_requires_cluster() {
        let task = ClusterOperationTask::shrink(Arc::new(MockKatoService::new()));
        let err = task.execute(&shrink_stage(json!({"credentials": "prod"}))).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidContext(_)));
    }

    #[tokio::test]
    async fn test_monitor_kato_statuses() {
        let mut kato = MockKatoService::new();
        let mut responses = vec![
            Err(ServiceError::not_found("task 42")),
            Ok(OperationStatus::default()),
            Ok(OperationStatus {
                completed: true,
                failed: false,
                message: None,
            }),
        ]
        .into_iter();
        kato.expect_operation_status()
            .times(3)
            .returning(move |_| responses.next().unwrap_or(Err(ServiceError::Network("eof".into()))));
        let task = MonitorKatoTask::new(Arc::new(kato));
        let stage = shrink_stage(json!({"kato.last.task.id": "42"}));

        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Running);
        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Running);
        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_monitor_kato_failure_and_transport_errors() {
        let mut kato = MockKatoService::new();
        let mut responses = vec![
            Ok(OperationStatus {
                completed: true,
                failed: true,
                message: Some("quota exceeded".into()),
            }),
            Err(ServiceError::Http {
                status: 503,
                message: "unavailable".into(),
            }),
        ]
        .into_iter();
        kato.expect_operation_status()
            .returning(move |_| responses.next().unwrap_or(Err(ServiceError::Network("eof".into()))));
        let task = MonitorKatoTask::new(Arc::new(kato));
        let stage = shrink_stage(json!({"kato.last.task.id": "42"}));

        let failed = task.execute(&stage).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Terminal);
        assert_eq!(failed.context["exception"]["details"]["error"], json!("quota exceeded"));

        let err = task.execute(&stage).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
