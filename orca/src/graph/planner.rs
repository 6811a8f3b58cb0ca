//! Turns a stage into tasks and synthetic stages.

use super::{StageGraphBuilder, StageResolver, TaskGraphBuilder};
use crate::errors::{GraphValidationError, OrcaError};
use crate::expressions::{process_default_entries, ContextParameterProcessor, ExpressionEvaluationSummary};
use crate::model::{context_keys, PipelineExecution, StageExecution};
use std::sync::Arc;
use tracing::{debug, warn};

/// The outcome of planning one stage.
#[derive(Debug, Clone)]
pub struct StagePlan {
    /// The stage with evaluated context and its tasks.
    pub stage: StageExecution,
    /// Synthetic stages to run before the stage's tasks.
    pub before_stages: Vec<StageExecution>,
    /// Expression outcomes.
    pub summary: ExpressionEvaluationSummary,
}

impl StagePlan {
    /// Writes the planned stage and its before stages into the execution.
    pub fn apply(self, execution: &mut PipelineExecution) -> Result<(), GraphValidationError> {
        let slot = execution
            .stage_mut(&self.stage.id)
            .ok_or_else(|| GraphValidationError::unknown_stage(&self.stage.id))?;
        *slot = self.stage;

        for stage in self.before_stages {
            execution.insert_synthetic(stage)?;
        }
        Ok(())
    }
}

/// Plans stages using the registered stage definitions.
#[derive(Debug, Clone)]
pub struct StagePlanner {
    stages: Arc<StageResolver>,
    processor: ContextParameterProcessor,
}

impl StagePlanner {
    /// Creates a new planner.
    #[must_use]
    pub fn new(stages: Arc<StageResolver>, processor: ContextParameterProcessor) -> Self {
        Self { stages, processor }
    }

    /// The stage registry.
    #[must_use]
    pub fn resolver(&self) -> &StageResolver {
        &self.stages
    }

    /// Whether a user's `manualSkip` applies to this stage.
    ///
    /// Only stage types that allow skipping honor the flag.
    #[must_use]
    pub fn is_manually_skipped(&self, stage: &StageExecution) -> bool {
        stage.is_manually_skipped()
            && self
                .stages
                .resolve(&stage.stage_type)
                .is_ok_and(|definition| definition.can_manually_skip())
    }

    /// Validates a submitted execution.
    ///
    /// Checks the requisite graph, that every stage type is registered and
    /// each definition's own context checks. Nothing is planned.
    pub fn validate(&self, execution: &PipelineExecution) -> Result<(), GraphValidationError> {
        execution.top_level_stages()?;
        for stage in &execution.stages {
            stage.validate_synthetic_linkage()?;
            self.stages.resolve(&stage.stage_type)?.validate(stage)?;
        }
        Ok(())
    }

    /// Plans a stage without modifying the execution.
    ///
    /// Expressions are evaluated first (unless the definition handles them
    /// itself), then tasks are declared when the stage has none yet, then
    /// the definition contributes before stages. After stages depend on
    /// what the tasks produced, see [`plan_after_stages`](Self::plan_after_stages).
    pub async fn plan(&self, execution: &PipelineExecution, stage_id: &str) -> Result<StagePlan, OrcaError> {
        let original = execution
            .stage_by_id(stage_id)
            .ok_or_else(|| GraphValidationError::unknown_stage(stage_id))?;
        original.validate_synthetic_linkage()?;
        let builder = self.stages.resolve(&original.stage_type)?;

        let mut stage = original.clone();
        let mut summary = ExpressionEvaluationSummary::new();
        let processor = self
            .processor
            .with_scope(ContextParameterProcessor::augmented_context(execution, stage_id));
        if builder.process_expressions(&mut stage, &processor, &mut summary) {
            process_default_entries(&mut stage, &processor, &mut summary, builder.expression_exclusions());
        }
        if summary.has_failures() {
            warn!(
                execution_id = %execution.id,
                stage_id = %stage.id,
                stage_type = %stage.stage_type,
                failures = summary.failure_count(),
                "Expression evaluation failed"
            );
            stage.context.insert(
                context_keys::EXPRESSION_SUMMARY.to_string(),
                serde_json::to_value(&summary)?,
            );
        }

        if stage.tasks.is_empty() {
            let mut tasks = TaskGraphBuilder::new();
            builder.task_graph(&stage, &mut tasks);
            stage.tasks = tasks.build();
        }

        let mut before = StageGraphBuilder::before_stages(&stage)
            .with_existing_count(execution.before_stages_of(stage_id).len());
        builder.before_stages(&stage, &mut before).await?;

        let before_stages: Vec<StageExecution> = before.build().collect();

        debug!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            stage_type = %stage.stage_type,
            tasks = stage.tasks.len(),
            before = before_stages.len(),
            "Planned stage"
        );

        Ok(StagePlan {
            stage,
            before_stages,
            summary,
        })
    }

    /// Builds the stages that run once a stage's tasks have succeeded.
    ///
    /// The definition sees the stage as the tasks left it, with outputs
    /// visible alongside the context.
    pub async fn plan_after_stages(
        &self,
        execution: &PipelineExecution,
        stage_id: &str,
    ) -> Result<Vec<StageExecution>, OrcaError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or_else(|| GraphValidationError::unknown_stage(stage_id))?;
        let builder = self.stages.resolve(&stage.stage_type)?;

        let mut view = stage.clone();
        for (key, value) in &stage.outputs {
            view.context.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let mut graph = StageGraphBuilder::after_stages(&view)
            .with_existing_count(execution.after_stages_of(stage_id).len());
        builder.after_stages(&view, &mut graph).await?;

        let stages: Vec<StageExecution> = graph.build().collect();
        debug!(
            execution_id = %execution.id,
            stage_id = %stage_id,
            after = stages.len(),
            "Planned after stages"
        );
        Ok(stages)
    }

    /// Builds the stages a failed stage contributes for cleanup.
    pub async fn plan_failure_stages(
        &self,
        execution: &PipelineExecution,
        stage_id: &str,
    ) -> Result<Vec<StageExecution>, OrcaError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or_else(|| GraphValidationError::unknown_stage(stage_id))?;
        let builder = self.stages.resolve(&stage.stage_type)?;

        let mut graph = StageGraphBuilder::after_stages(stage)
            .with_existing_count(execution.after_stages_of(stage_id).len());
        builder.on_failure_stages(stage, &mut graph).await?;
        Ok(graph.build().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContextMap, ExecutionType, SyntheticStageOwner};
    use crate::expressions::PlaceholderEvaluator;
    use crate::graph::StageDefinitionBuilder;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Parent;

    #[async_trait]
    impl StageDefinitionBuilder for Parent {
        fn stage_type(&self) -> &str {
            "parent"
        }

        fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
            tasks.with_task("first", "noop").with_task("second", "noop");
        }

        async fn before_stages(&self, _stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
            graph.append(|s| {
                s.stage_type = "child".into();
                s.name = "setup".into();
            });
            Ok(())
        }

        async fn after_stages(&self, stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
            let count = stage.context_u64("cleanupCount").unwrap_or(0);
            for i in 0..count {
                graph.append(|s| {
                    s.stage_type = "child".into();
                    s.name = format!("cleanup-{i}");
                });
            }
            Ok(())
        }

        async fn on_failure_stages(&self, _stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
            graph.add(|s| {
                s.stage_type = "child".into();
                s.name = "rollback".into();
            });
            Ok(())
        }

        fn expression_exclusions(&self) -> &[&str] {
            &["raw"]
        }
    }

    struct Child;

    impl StageDefinitionBuilder for Child {
        fn stage_type(&self) -> &str {
            "child"
        }
    }

    struct Skippable;

    impl StageDefinitionBuilder for Skippable {
        fn stage_type(&self) -> &str {
            "skippable"
        }

        fn can_manually_skip(&self) -> bool {
            true
        }
    }

    fn planner() -> StagePlanner {
        let stages = StageResolver::new();
        stages.register(Arc::new(Parent)).unwrap();
        stages.register(Arc::new(Child)).unwrap();
        StagePlanner::new(
            Arc::new(stages),
            ContextParameterProcessor::new(Arc::new(PlaceholderEvaluator::new())),
        )
    }

    fn execution(context: serde_json::Value) -> (PipelineExecution, String) {
        let Some(map) = context.as_object().cloned() else {
            panic!("object expected");
        };
        let stage = StageExecution::new("", "parent", "Parent", map).with_ref_id("1");
        let id = stage.id.clone();
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_trigger(json!({"user": "alice"}))
            .with_stage(stage);
        (execution, id)
    }

    #[tokio::test]
    async fn test_plan_builds_tasks_and_synthetic_stages() {
        let (mut execution, id) = execution(json!({"cleanupCount": "${1+1}", "raw": "${1+1}"}));
        let plan = planner().plan(&execution, &id).await.unwrap();

        assert_eq!(plan.stage.context["cleanupCount"], json!(2));
        assert_eq!(plan.stage.context["raw"], json!("${1+1}"));
        assert_eq!(plan.stage.tasks.len(), 2);
        assert_eq!(plan.before_stages.len(), 1);

        plan.apply(&mut execution).unwrap();
        let order: Vec<&str> = execution.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["setup", "Parent"]);
        assert_eq!(
            execution.stages[0].synthetic_stage_owner,
            Some(SyntheticStageOwner::Before)
        );
    }

    #[tokio::test]
    async fn test_after_stages_see_task_outputs() {
        let (mut execution, id) = execution(json!({}));
        let stages = planner().plan_after_stages(&execution, &id).await.unwrap();
        assert!(stages.is_empty());

        if let Some(stage) = execution.stage_mut(&id) {
            stage.outputs.insert("cleanupCount".to_string(), json!(2));
        }
        let stages = planner().plan_after_stages(&execution, &id).await.unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].ref_id.as_deref(), Some("1>2"));
        assert_eq!(stages[0].synthetic_stage_owner, Some(SyntheticStageOwner::After));

        for stage in stages {
            execution.insert_synthetic(stage).unwrap();
        }
        let order: Vec<&str> = execution.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["Parent", "cleanup-0", "cleanup-1"]);
    }

    #[tokio::test]
    async fn test_plan_records_expression_failures() {
        let (execution, id) = execution(json!({"image": "${trigger.missing}"}));
        let plan = planner().plan(&execution, &id).await.unwrap();

        assert!(plan.summary.has_failures());
        assert_eq!(plan.stage.context["image"], json!("${trigger.missing}"));
        assert!(plan.stage.context.contains_key("expressionEvaluationSummary"));
    }

    #[tokio::test]
    async fn test_plan_unknown_type() {
        let stage = StageExecution::new("", "bogus", "Bogus", ContextMap::new());
        let id = stage.id.clone();
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app").with_stage(stage);

        let err = planner().plan(&execution, &id).await.unwrap_err();
        assert!(matches!(err, OrcaError::Validation(_)));
    }

    #[test]
    fn test_manual_skip_requires_skippable_type() {
        let stages = StageResolver::new();
        stages.register(Arc::new(Parent)).unwrap();
        stages.register(Arc::new(Skippable)).unwrap();
        let planner = StagePlanner::new(
            Arc::new(stages),
            ContextParameterProcessor::new(Arc::new(PlaceholderEvaluator::new())),
        );

        let flagged = |stage_type: &str| {
            StageExecution::new("", stage_type, "s", ContextMap::new()).with_context_entry("manualSkip", true)
        };
        assert!(planner.is_manually_skipped(&flagged("skippable")));
        assert!(!planner.is_manually_skipped(&flagged("parent")));
        assert!(!planner.is_manually_skipped(&flagged("bogus")));
        assert!(!planner.is_manually_skipped(&StageExecution::new("", "skippable", "s", ContextMap::new())));
    }

    #[tokio::test]
    async fn test_plan_failure_stages() {
        let (execution, id) = execution(json!({}));
        let stages = planner().plan_failure_stages(&execution, &id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, "rollback");
        assert_eq!(stages[0].synthetic_stage_owner, Some(SyntheticStageOwner::After));
    }

    #[test]
    fn test_validate_checks_types_and_requisites() {
        let (execution, _) = execution(json!({}));
        assert!(planner().validate(&execution).is_ok());

        let unknown = execution
            .clone()
            .with_stage(StageExecution::new("", "bogus", "Bogus", ContextMap::new()).with_ref_id("2"));
        let err = planner().validate(&unknown).unwrap_err();
        assert_eq!(err.code.as_deref(), Some("GRAPH-UNKNOWN-TYPE"));

        let dangling = execution.with_stage(
            StageExecution::new("", "child", "Child", ContextMap::new())
                .with_ref_id("3")
                .with_requisites(["9"]),
        );
        assert!(planner().validate(&dangling).is_err());
    }
}
