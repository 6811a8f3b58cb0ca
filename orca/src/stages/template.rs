//! Pipeline template updates and the fan-out to dependent pipelines.

use crate::core::TaskResult;
use crate::errors::{GraphValidationError, OrcaError, TaskError};
use crate::graph::{StageDefinitionBuilder, StageGraphBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::services::Front50Service;
use crate::tasks::Task;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const PIPELINE_TEMPLATE: &str = "pipelineTemplate";
const SKIP_PLAN_DEPENDENTS: &str = "skipPlanDependents";

/// Decodes the `pipelineTemplate` context entry.
///
/// The template is either base64-encoded JSON or an inline object.
pub fn pipeline_template_of(stage: &StageExecution) -> Result<Value, GraphValidationError> {
    let invalid = |reason: String| {
        GraphValidationError::new(format!("Invalid {PIPELINE_TEMPLATE} for stage {}: {reason}", stage.id))
            .with_stages(vec![stage.id.clone()])
            .with_code("GRAPH-INVALID-CONTEXT")
    };

    match stage.context.get(PIPELINE_TEMPLATE) {
        None | Some(Value::Null) => Err(GraphValidationError::missing_context(
            &stage.stage_type,
            PIPELINE_TEMPLATE,
        )
        .with_stages(vec![stage.id.clone()])),
        Some(Value::String(encoded)) => {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|e| invalid(e.to_string()))?;
            let template: Value = serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
            if template.is_object() {
                Ok(template)
            } else {
                Err(invalid("not a JSON object".to_string()))
            }
        }
        Some(template @ Value::Object(_)) => Ok(template.clone()),
        Some(_) => Err(invalid("expected base64 JSON or an object".to_string())),
    }
}

fn template_id(template: &Value) -> Option<&str> {
    template.get("id").and_then(Value::as_str)
}

/// Saves a pipeline template and updates every pipeline built from it.
pub struct UpdatePipelineTemplateStage {
    front50: Arc<dyn Front50Service>,
}

impl std::fmt::Debug for UpdatePipelineTemplateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePipelineTemplateStage").finish_non_exhaustive()
    }
}

impl UpdatePipelineTemplateStage {
    /// Stage type key.
    pub const TYPE: &'static str = "updatePipelineTemplate";

    /// Creates a new stage definition.
    #[must_use]
    pub fn new(front50: Arc<dyn Front50Service>) -> Self {
        Self { front50 }
    }
}

#[async_trait]
impl StageDefinitionBuilder for UpdatePipelineTemplateStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn validate(&self, stage: &StageExecution) -> Result<(), GraphValidationError> {
        pipeline_template_of(stage).map(|_| ())
    }

    fn task_graph(&self, stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks.with_task("updatePipelineTemplate", UpdatePipelineTemplateTask::TYPE);
        if stage.context_bool(SKIP_PLAN_DEPENDENTS) != Some(true) {
            tasks.with_task("planDependentPipelines", PlanTemplateDependentsTask::TYPE);
        }
    }

    async fn after_stages(&self, stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
        let template = pipeline_template_of(stage)?;
        if stage.context_bool(SKIP_PLAN_DEPENDENTS) == Some(true) {
            return Ok(());
        }
        let id = template_id(&template).ok_or_else(|| {
            GraphValidationError::missing_context(Self::TYPE, "pipelineTemplate.id").with_stages(vec![stage.id.clone()])
        })?;

        let dependents = self.front50.pipeline_template_dependents(id, true).await?;
        info!(template_id = id, dependents = dependents.len(), "Updating dependent pipelines");
        for pipeline in dependents {
            let name = pipeline
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unnamed")
                .to_string();
            graph.append(|s| {
                s.stage_type = UpdatePipelineStage::TYPE.to_string();
                s.name = format!("Update pipeline: {name}");
                s.context.insert("pipeline".to_string(), pipeline);
            });
        }
        Ok(())
    }

    fn expression_exclusions(&self) -> &[&str] {
        &[PIPELINE_TEMPLATE]
    }
}

/// Saves one pipeline definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdatePipelineStage;

impl UpdatePipelineStage {
    /// Stage type key.
    pub const TYPE: &'static str = "updatePipeline";
}

impl StageDefinitionBuilder for UpdatePipelineStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks.with_task("updatePipeline", UpdatePipelineTask::TYPE);
    }
}

/// Writes the template to front50.
pub struct UpdatePipelineTemplateTask {
    front50: Arc<dyn Front50Service>,
}

impl std::fmt::Debug for UpdatePipelineTemplateTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePipelineTemplateTask").finish_non_exhaustive()
    }
}

impl UpdatePipelineTemplateTask {
    /// Task type key.
    pub const TYPE: &'static str = "updatePipelineTemplate";

    /// Creates a new task.
    #[must_use]
    pub fn new(front50: Arc<dyn Front50Service>) -> Self {
        Self { front50 }
    }
}

#[async_trait]
impl Task for UpdatePipelineTemplateTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let template = pipeline_template_of(stage).map_err(|e| TaskError::InvalidContext(e.message))?;
        let id = template_id(&template)
            .ok_or_else(|| TaskError::InvalidContext("pipelineTemplate has no id".to_string()))?
            .to_string();

        self.front50.update_pipeline_template(&id, template).await?;
        Ok(TaskResult::succeeded()
            .with_context_entry("notification.type", "updatepipelinetemplate")
            .with_output("pipelineTemplate.id", id))
    }
}

/// Checks every dependent pipeline before the fan-out runs.
///
/// A dependent without an id or name cannot be saved, so the stage fails
/// with the list of offending pipelines instead of half-updating them.
pub struct PlanTemplateDependentsTask {
    front50: Arc<dyn Front50Service>,
}

impl std::fmt::Debug for PlanTemplateDependentsTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanTemplateDependentsTask").finish_non_exhaustive()
    }
}

impl PlanTemplateDependentsTask {
    /// Task type key.
    pub const TYPE: &'static str = "planTemplateDependents";

    /// Creates a new task.
    #[must_use]
    pub fn new(front50: Arc<dyn Front50Service>) -> Self {
        Self { front50 }
    }
}

#[async_trait]
impl Task for PlanTemplateDependentsTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let template = pipeline_template_of(stage).map_err(|e| TaskError::InvalidContext(e.message))?;
        let id = template_id(&template)
            .ok_or_else(|| TaskError::InvalidContext("pipelineTemplate has no id".to_string()))?;

        let dependents = self.front50.pipeline_template_dependents(id, true).await?;
        let mut planned = Vec::new();
        let mut errors = serde_json::Map::new();
        for (index, pipeline) in dependents.iter().enumerate() {
            let pipeline_id = pipeline.get("id").and_then(Value::as_str);
            let name = pipeline.get("name").and_then(Value::as_str);
            match (pipeline_id, name) {
                (Some(pipeline_id), Some(_)) => planned.push(json!(pipeline_id)),
                _ => {
                    let key = pipeline_id.map_or_else(|| format!("#{index}"), str::to_string);
                    errors.insert(key, json!("dependent pipeline must have an id and a name"));
                }
            }
        }

        if !errors.is_empty() {
            warn!(template_id = id, failed = errors.len(), "Dependent pipelines cannot be updated");
            return Ok(TaskResult::terminal()
                .with_context_entry("notification.type", "plantemplatedependents")
                .with_context_entry("pipelineTemplate.dependentErrors", Value::Object(errors)));
        }
        Ok(TaskResult::succeeded()
            .with_context_entry("notification.type", "plantemplatedependents")
            .with_output("pipelineTemplate.dependentPipelines", Value::Array(planned)))
    }
}

/// Saves the pipeline in the `pipeline` context entry.
pub struct UpdatePipelineTask {
    front50: Arc<dyn Front50Service>,
}

impl std::fmt::Debug for UpdatePipelineTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePipelineTask").finish_non_exhaustive()
    }
}

impl UpdatePipelineTask {
    /// Task type key.
    pub const TYPE: &'static str = "updatePipeline";

    /// Creates a new task.
    #[must_use]
    pub fn new(front50: Arc<dyn Front50Service>) -> Self {
        Self { front50 }
    }
}

#[async_trait]
impl Task for UpdatePipelineTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let pipeline = stage
            .context
            .get("pipeline")
            .filter(|p| p.is_object())
            .cloned()
            .ok_or_else(|| TaskError::InvalidContext("missing 'pipeline'".to_string()))?;
        let id = pipeline.get("id").cloned().unwrap_or(Value::Null);
        let name = pipeline.get("name").cloned().unwrap_or(Value::Null);

        self.front50.save_pipeline(pipeline).await?;
        Ok(TaskResult::succeeded()
            .with_context_entry("notification.type", "savepipeline")
            .with_output("pipeline.id", id)
            .with_output("pipeline.name", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContextMap, ExecutionStatus};
    use crate::errors::ServiceError;
    use crate::services::MockFront50Service;
    use pretty_assertions::assert_eq;

    fn stage(context: Value) -> StageExecution {
        let Value::Object(context) = context else {
            panic!("object expected");
        };
        StageExecution::new("exec", UpdatePipelineTemplateStage::TYPE, "Update template", context).with_ref_id("1")
    }

    fn encoded(template: &Value) -> String {
        STANDARD.encode(template.to_string())
    }

    fn dependents() -> Vec<Value> {
        vec![
            json!({"id": "p1", "name": "deploy-prod"}),
            json!({"id": "p2", "name": "deploy-staging"}),
        ]
    }

    #[test]
    fn test_decode_base64_and_object() {
        let template = json!({"id": "t1", "schema": "v2"});
        let from_base64 = pipeline_template_of(&stage(json!({"pipelineTemplate": encoded(&template)}))).unwrap();
        let inline = pipeline_template_of(&stage(json!({"pipelineTemplate": template.clone()}))).unwrap();
        assert_eq!(from_base64, template);
        assert_eq!(inline, template);
    }

    #[test]
    fn test_missing_and_invalid_template() {
        let missing = pipeline_template_of(&stage(json!({}))).unwrap_err();
        assert_eq!(missing.code.as_deref(), Some("GRAPH-MISSING-CONTEXT"));

        let invalid = pipeline_template_of(&stage(json!({"pipelineTemplate": "%%%"}))).unwrap_err();
        assert_eq!(invalid.code.as_deref(), Some("GRAPH-INVALID-CONTEXT"));

        let definition = UpdatePipelineTemplateStage::new(Arc::new(MockFront50Service::new()));
        assert!(definition.validate(&stage(json!({}))).is_err());
    }

    #[tokio::test]
    async fn test_after_stages_fan_out_per_dependent() {
        let mut front50 = MockFront50Service::new();
        front50
            .expect_pipeline_template_dependents()
            .withf(|id, recursive| id == "t1" && *recursive)
            .times(1)
            .returning(|_, _| Ok(dependents()));
        let definition = UpdatePipelineTemplateStage::new(Arc::new(front50));
        let stage = stage(json!({"pipelineTemplate": encoded(&json!({"id": "t1"}))}));

        let mut graph = StageGraphBuilder::after_stages(&stage);
        definition.after_stages(&stage, &mut graph).await.unwrap();
        let stages: Vec<StageExecution> = graph.build().collect();

        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_type, "updatePipeline");
        assert_eq!(stages[0].name, "Update pipeline: deploy-prod");
        assert_eq!(stages[0].context["pipeline"]["id"], json!("p1"));
        assert_eq!(stages[1].requisite_stage_ref_ids, vec!["1>1".to_string()]);
    }

    #[tokio::test]
    async fn test_after_stages_require_template() {
        let definition = UpdatePipelineTemplateStage::new(Arc::new(MockFront50Service::new()));
        let stage = stage(json!({}));
        let mut graph = StageGraphBuilder::after_stages(&stage);

        let err = definition.after_stages(&stage, &mut graph).await.unwrap_err();
        assert!(matches!(err, OrcaError::Validation(_)));
    }

    #[tokio::test]
    async fn test_skip_plan_dependents() {
        let definition = UpdatePipelineTemplateStage::new(Arc::new(MockFront50Service::new()));
        let stage = stage(json!({"pipelineTemplate": {"id": "t1"}, "skipPlanDependents": true}));

        let mut tasks = TaskGraphBuilder::new();
        definition.task_graph(&stage, &mut tasks);
        assert_eq!(tasks.len(), 1);

        let mut graph = StageGraphBuilder::after_stages(&stage);
        definition.after_stages(&stage, &mut graph).await.unwrap();
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn test_update_template_task() {
        let mut front50 = MockFront50Service::new();
        front50
            .expect_update_pipeline_template()
            .withf(|id, template| id == "t1" && template["schema"] == json!("v2"))
            .times(1)
            .returning(|_, _| Ok(()));
        let task = UpdatePipelineTemplateTask::new(Arc::new(front50));
        let stage = stage(json!({"pipelineTemplate": encoded(&json!({"id": "t1", "schema": "v2"}))}));

        let result = task.execute(&stage).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.outputs["pipelineTemplate.id"], json!("t1"));
    }

    #[tokio::test]
    async fn test_plan_dependents_reports_invalid_pipelines() {
        let mut front50 = MockFront50Service::new();
        front50
            .expect_pipeline_template_dependents()
            .returning(|_, _| Ok(vec![json!({"id": "p1", "name": "ok"}), json!({"id": "p2"})]));
        let task = PlanTemplateDependentsTask::new(Arc::new(front50));

        let result = task
            .execute(&stage(json!({"pipelineTemplate": {"id": "t1"}})))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Terminal);
        assert!(result.context["pipelineTemplate.dependentErrors"].get("p2").is_some());
    }

    #[tokio::test]
    async fn test_update_pipeline_task() {
        let mut front50 = MockFront50Service::new();
        let mut responses = vec![
            Ok(()),
            Err(ServiceError::Http {
                status: 400,
                message: "bad pipeline".into(),
            }),
        ]
        .into_iter();
        front50
            .expect_save_pipeline()
            .times(2)
            .returning(move |_| responses.next().unwrap_or(Ok(())));
        let task = UpdatePipelineTask::new(Arc::new(front50));
        let mut context = ContextMap::new();
        context.insert("pipeline".into(), json!({"id": "p1", "name": "deploy"}));
        let stage = StageExecution::new("exec", UpdatePipelineStage::TYPE, "Update", context);

        let result = task.execute(&stage).await.unwrap();
        assert_eq!(result.outputs["pipeline.name"], json!("deploy"));

        let err = task.execute(&stage).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
