//! User-defined variables evaluated in declaration order.

use crate::core::TaskResult;
use crate::errors::{GraphValidationError, TaskError};
use crate::expressions::{process_default_entries, ContextParameterProcessor, ExpressionEvaluationSummary};
use crate::graph::{StageDefinitionBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::tasks::Task;
use async_trait::async_trait;
use serde_json::Value;

const VARIABLES: &str = "variables";

/// Evaluates the `variables` list and exposes each entry as an output.
///
/// Later variables may refer to earlier ones, so the list is evaluated
/// sequentially instead of through generic context processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluateVariablesStage;

impl EvaluateVariablesStage {
    /// Stage type key.
    pub const TYPE: &'static str = "evaluateVariables";
}

fn variable_key(variable: &Value) -> Option<&str> {
    variable.get("key").and_then(Value::as_str)
}

impl StageDefinitionBuilder for EvaluateVariablesStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn validate(&self, stage: &StageExecution) -> Result<(), GraphValidationError> {
        let invalid = || {
            GraphValidationError::new(format!(
                "Stage {} requires '{VARIABLES}' to be a list of {{key, value}} entries",
                stage.id
            ))
            .with_stages(vec![stage.id.clone()])
            .with_code("GRAPH-INVALID-CONTEXT")
        };
        match stage.context.get(VARIABLES) {
            None => Ok(()),
            Some(Value::Array(variables)) if variables.iter().all(|v| variable_key(v).is_some()) => Ok(()),
            Some(_) => Err(invalid()),
        }
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks.with_task("evaluateVariables", EvaluateVariablesTask::TYPE);
    }

    fn process_expressions(
        &self,
        stage: &mut StageExecution,
        processor: &ContextParameterProcessor,
        summary: &mut ExpressionEvaluationSummary,
    ) -> bool {
        process_default_entries(stage, processor, summary, &[VARIABLES]);

        let Some(Value::Array(variables)) = stage.context.get_mut(VARIABLES) else {
            return false;
        };
        let mut scope = processor.scope().clone();
        for variable in variables.iter_mut() {
            let Some(key) = variable_key(variable).map(str::to_string) else {
                continue;
            };
            let Some(source) = variable.get("value").cloned() else {
                continue;
            };
            let value = processor.with_scope(scope.clone()).process_value(&source, summary);
            scope.insert(key, value.clone());
            if let Some(entry) = variable.as_object_mut() {
                entry.insert("value".to_string(), value);
                if source != entry["value"] {
                    entry.insert("sourceValue".to_string(), source);
                }
            }
        }
        false
    }
}

/// Publishes the evaluated variables as stage outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluateVariablesTask;

impl EvaluateVariablesTask {
    /// Task type key.
    pub const TYPE: &'static str = "evaluateVariables";
}

#[async_trait]
impl Task for EvaluateVariablesTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let variables = match stage.context.get(VARIABLES) {
            None => return Ok(TaskResult::succeeded()),
            Some(Value::Array(variables)) => variables,
            Some(_) => return Err(TaskError::InvalidContext(format!("'{VARIABLES}' must be a list"))),
        };

        let mut result = TaskResult::succeeded();
        for variable in variables {
            let key = variable_key(variable)
                .ok_or_else(|| TaskError::InvalidContext("variable without a key".to_string()))?;
            let value = variable.get("value").cloned().unwrap_or(Value::Null);
            result = result.with_output(key, value);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::expressions::PlaceholderEvaluator;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn stage(context: Value) -> StageExecution {
        let Value::Object(context) = context else {
            panic!("object expected");
        };
        StageExecution::new("exec", EvaluateVariablesStage::TYPE, "Evaluate variables", context)
    }

    fn processor(scope: Value) -> ContextParameterProcessor {
        let Value::Object(scope) = scope else {
            panic!("object expected");
        };
        ContextParameterProcessor::new(Arc::new(PlaceholderEvaluator::new())).with_scope(scope)
    }

    #[test]
    fn test_variables_see_earlier_variables() {
        let mut stage = stage(json!({
            "variables": [
                {"key": "region", "value": "${deployRegion}"},
                {"key": "target", "value": "${region}"},
                {"key": "literal", "value": "fixed"},
            ],
        }));
        let mut summary = ExpressionEvaluationSummary::new();

        let proceed =
            EvaluateVariablesStage.process_expressions(&mut stage, &processor(json!({"deployRegion": "eu-west-1"})), &mut summary);

        assert!(!proceed);
        let variables = &stage.context["variables"];
        assert_eq!(variables[0]["value"], json!("eu-west-1"));
        assert_eq!(variables[0]["sourceValue"], json!("${deployRegion}"));
        assert_eq!(variables[1]["value"], json!("eu-west-1"));
        assert_eq!(variables[2]["value"], json!("fixed"));
        assert!(variables[2].get("sourceValue").is_none());
        assert!(!summary.has_failures());
    }

    #[test]
    fn test_other_entries_still_evaluated() {
        let mut stage = stage(json!({"note": "${1+1}", "variables": []}));
        let mut summary = ExpressionEvaluationSummary::new();

        EvaluateVariablesStage.process_expressions(&mut stage, &processor(json!({})), &mut summary);
        assert_eq!(stage.context["note"], json!(2));
    }

    #[test]
    fn test_validate_requires_keys() {
        assert!(EvaluateVariablesStage.validate(&stage(json!({}))).is_ok());
        assert!(EvaluateVariablesStage
            .validate(&stage(json!({"variables": [{"value": 1}]})))
            .is_err());
        assert!(EvaluateVariablesStage.validate(&stage(json!({"variables": "x"}))).is_err());
    }

    #[tokio::test]
    async fn test_task_outputs_variables() {
        let stage = stage(json!({
            "variables": [{"key": "a", "value": 1}, {"key": "b", "value": "two"}],
        }));

        let result = EvaluateVariablesTask.execute(&stage).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.outputs["a"], json!(1));
        assert_eq!(result.outputs["b"], json!("two"));
    }
}
