//! Test assertions for executions and stages.

use crate::core::ExecutionStatus;
use crate::model::{PipelineExecution, StageExecution};

fn find_stage<'a>(execution: &'a PipelineExecution, name: &str) -> &'a StageExecution {
    execution
        .stages
        .iter()
        .find(|s| s.name == name || s.ref_id.as_deref() == Some(name))
        .unwrap_or_else(|| {
            panic!(
                "No stage named '{name}'. Stages: {:?}",
                execution.stages.iter().map(|s| &s.name).collect::<Vec<_>>()
            )
        })
}

/// Asserts the status of the stage with the given name or ref id.
pub fn assert_stage_status(execution: &PipelineExecution, name: &str, expected: ExecutionStatus) {
    let stage = find_stage(execution, name);
    assert_eq!(
        stage.status, expected,
        "Expected stage '{name}' to be {expected}, got {}",
        stage.status
    );
}

/// Asserts the stored order of stage names.
pub fn assert_stage_order(execution: &PipelineExecution, expected: &[&str]) {
    let actual: Vec<&str> = execution.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(actual, expected, "Unexpected stage order");
}

/// Asserts that a stage recorded an exception of the given type.
pub fn assert_stage_exception(execution: &PipelineExecution, name: &str, exception_type: &str) {
    let stage = find_stage(execution, name);
    let actual = stage
        .context
        .get("exception")
        .and_then(|e| e.get("exceptionType"))
        .and_then(serde_json::Value::as_str);
    assert_eq!(
        actual,
        Some(exception_type),
        "Expected stage '{name}' to record a {exception_type}, context: {:?}",
        stage.context
    );
}

/// Asserts that a stage is a synthetic child of another.
pub fn assert_synthetic_child(execution: &PipelineExecution, child: &str, parent: &str) {
    let child = find_stage(execution, child);
    let parent = find_stage(execution, parent);
    assert_eq!(
        child.parent_stage_id.as_deref(),
        Some(parent.id.as_str()),
        "Expected '{}' to be a child of '{}'",
        child.name,
        parent.name
    );
}
