//! Walks stage contexts and rewrites expressions in place.

use super::{ExpressionEvaluationSummary, ExpressionEvaluator};
use crate::core::ContextMap;
use crate::model::{PipelineExecution, StageExecution};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Evaluates expressions found in JSON values against a scope.
///
/// The scope is usually the augmented context of a stage: the merged stage
/// context plus `execution` and `trigger` entries.
#[derive(Clone)]
pub struct ContextParameterProcessor {
    evaluator: Arc<dyn ExpressionEvaluator>,
    scope: ContextMap,
}

impl fmt::Debug for ContextParameterProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextParameterProcessor")
            .field("scope_keys", &self.scope.len())
            .finish_non_exhaustive()
    }
}

impl ContextParameterProcessor {
    /// Creates a processor with an empty scope.
    #[must_use]
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            evaluator,
            scope: ContextMap::new(),
        }
    }

    /// Returns a processor sharing the evaluator with a different scope.
    #[must_use]
    pub fn with_scope(&self, scope: ContextMap) -> Self {
        Self {
            evaluator: Arc::clone(&self.evaluator),
            scope,
        }
    }

    /// The current scope.
    #[must_use]
    pub fn scope(&self) -> &ContextMap {
        &self.scope
    }

    /// Builds the augmented context for a stage.
    #[must_use]
    pub fn augmented_context(execution: &PipelineExecution, stage_id: &str) -> ContextMap {
        let mut augmented = execution.merged_context_of(stage_id);
        augmented.insert(
            "execution".to_string(),
            json!({
                "id": execution.id,
                "application": execution.application,
                "name": execution.name,
                "type": execution.execution_type,
                "status": execution.status,
                "trigger": execution.trigger,
            }),
        );
        if !augmented.contains_key("trigger") {
            augmented.insert("trigger".to_string(), execution.trigger.clone());
        }
        augmented
    }

    /// Returns true if the value contains an expression anywhere.
    #[must_use]
    pub fn contains_expression(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.evaluator.contains_expression(s),
            Value::Array(items) => items.iter().any(|v| self.contains_expression(v)),
            Value::Object(map) => map.values().any(|v| self.contains_expression(v)),
            _ => false,
        }
    }

    /// Evaluates every expression in `source`.
    ///
    /// Failed expressions keep their original text and are recorded in the
    /// summary.
    pub fn process(&self, source: &ContextMap, summary: &mut ExpressionEvaluationSummary) -> ContextMap {
        source
            .iter()
            .map(|(key, value)| (key.clone(), self.process_value(value, summary)))
            .collect()
    }

    /// Evaluates every expression in one value.
    pub fn process_value(&self, value: &Value, summary: &mut ExpressionEvaluationSummary) -> Value {
        match value {
            Value::String(text) if self.evaluator.contains_expression(text) => {
                summary.record_evaluated();
                match self.evaluator.evaluate(text, &self.scope) {
                    Ok(result) => result,
                    Err(err) => {
                        summary.add_failure(text.clone(), err.reason);
                        value.clone()
                    }
                }
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), self.process_value(child, summary)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.process_value(item, summary)).collect())
            }
            other => other.clone(),
        }
    }
}

/// Evaluates each context entry of a stage independently.
///
/// Every key outside `excluded_keys` is wrapped in a singleton map and
/// evaluated against the processor's scope, which is captured once before the
/// walk, so the order of keys never affects the results. Only the evaluated
/// key is written back.
pub fn process_default_entries(
    stage: &mut StageExecution,
    processor: &ContextParameterProcessor,
    summary: &mut ExpressionEvaluationSummary,
    excluded_keys: &[&str],
) {
    let keys: Vec<String> = stage
        .context
        .keys()
        .filter(|key| !excluded_keys.contains(&key.as_str()))
        .cloned()
        .collect();

    for key in keys {
        let Some(value) = stage.context.get(&key) else {
            continue;
        };
        let mut single = ContextMap::new();
        single.insert(key.clone(), value.clone());

        let mut processed = processor.process(&single, summary);
        if let Some(result) = processed.remove(&key) {
            stage.context.insert(key, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionType;
    use crate::expressions::PlaceholderEvaluator;
    use pretty_assertions::assert_eq;

    fn processor() -> ContextParameterProcessor {
        ContextParameterProcessor::new(Arc::new(PlaceholderEvaluator::new()))
    }

    fn stage_with(context: Value) -> StageExecution {
        let Value::Object(map) = context else {
            panic!("context must be an object");
        };
        StageExecution::new("exec", "wait", "Wait", map)
    }

    #[test]
    fn test_default_entries_evaluate_expressions() {
        let mut stage = stage_with(json!({"a": "${1+1}", "b": "literal"}));
        let mut summary = ExpressionEvaluationSummary::new();

        process_default_entries(&mut stage, &processor(), &mut summary, &[]);

        assert_eq!(stage.context["a"], json!(2));
        assert_eq!(stage.context["b"], json!("literal"));
        assert_eq!(summary.total_evaluated, 1);
        assert!(!summary.has_failures());
    }

    #[test]
    fn test_default_entries_respect_exclusions() {
        let mut stage = stage_with(json!({"a": "${1+1}", "b": "literal"}));
        let mut summary = ExpressionEvaluationSummary::new();

        process_default_entries(&mut stage, &processor(), &mut summary, &["b"]);
        assert_eq!(stage.context["a"], json!(2));
        assert_eq!(stage.context["b"], json!("literal"));

        let mut stage = stage_with(json!({"a": "${1+1}"}));
        process_default_entries(&mut stage, &processor(), &mut summary, &["a"]);
        assert_eq!(stage.context["a"], json!("${1+1}"));
    }

    #[test]
    fn test_default_entries_use_pre_walk_snapshot() {
        let mut scope = ContextMap::new();
        scope.insert("a".into(), json!("original"));
        let scoped = processor().with_scope(scope);

        let mut stage = stage_with(json!({"a": "changed", "b": "${a}"}));
        let mut summary = ExpressionEvaluationSummary::new();
        process_default_entries(&mut stage, &scoped, &mut summary, &[]);

        assert_eq!(stage.context["b"], json!("original"));
    }

    #[test]
    fn test_failures_keep_original_value() {
        let mut stage = stage_with(json!({"image": "${missing.value}", "nested": {"x": ["${2*3}"]}}));
        let mut summary = ExpressionEvaluationSummary::new();

        process_default_entries(&mut stage, &processor(), &mut summary, &[]);

        assert_eq!(stage.context["image"], json!("${missing.value}"));
        assert_eq!(stage.context["nested"], json!({"x": [6]}));
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(summary.total_evaluated, 2);
    }

    #[test]
    fn test_augmented_context() {
        let stage = stage_with(json!({"cluster": "app-main"}));
        let stage_id = stage.id.clone();
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_trigger(json!({"user": "alice"}))
            .with_stage(stage);

        let augmented = ContextParameterProcessor::augmented_context(&execution, &stage_id);
        assert_eq!(augmented["cluster"], json!("app-main"));
        assert_eq!(augmented["trigger"]["user"], json!("alice"));
        assert_eq!(augmented["execution"]["application"], json!("app"));

        let scoped = processor().with_scope(augmented);
        let mut summary = ExpressionEvaluationSummary::new();
        let value = scoped.process_value(&json!("deploy ${cluster} for ${trigger.user}"), &mut summary);
        assert_eq!(value, json!("deploy app-main for alice"));
    }

    #[test]
    fn test_contains_expression() {
        let p = processor();
        assert!(p.contains_expression(&json!({"a": [1, "${x}"]})));
        assert!(!p.contains_expression(&json!({"a": [1, "plain"]})));
    }
}
