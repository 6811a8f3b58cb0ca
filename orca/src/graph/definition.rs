//! Per-stage-type strategy contributing tasks and synthetic stages.

use super::{StageGraphBuilder, TaskGraphBuilder};
use crate::errors::{GraphValidationError, OrcaError};
use crate::expressions::{ContextParameterProcessor, ExpressionEvaluationSummary};
use crate::model::StageExecution;
use async_trait::async_trait;

/// Defines how a stage type is planned.
///
/// Everything except [`stage_type`](Self::stage_type) has a default, so a
/// definition only overrides what it contributes.
#[async_trait]
pub trait StageDefinitionBuilder: Send + Sync {
    /// The type key stages use to select this definition.
    fn stage_type(&self) -> &str;

    /// Additional type keys that resolve to this definition.
    fn aliases(&self) -> Vec<String> {
        Vec::new()
    }

    /// Checks the submitted context before the execution starts.
    fn validate(&self, _stage: &StageExecution) -> Result<(), GraphValidationError> {
        Ok(())
    }

    /// Declares the stage's tasks in execution order.
    fn task_graph(&self, _stage: &StageExecution, _tasks: &mut TaskGraphBuilder) {}

    /// Adds stages that run before this stage's tasks.
    async fn before_stages(
        &self,
        _stage: &StageExecution,
        _graph: &mut StageGraphBuilder,
    ) -> Result<(), OrcaError> {
        Ok(())
    }

    /// Adds stages that run after this stage's tasks.
    async fn after_stages(
        &self,
        _stage: &StageExecution,
        _graph: &mut StageGraphBuilder,
    ) -> Result<(), OrcaError> {
        Ok(())
    }

    /// Adds stages that run after this stage fails.
    async fn on_failure_stages(
        &self,
        _stage: &StageExecution,
        _graph: &mut StageGraphBuilder,
    ) -> Result<(), OrcaError> {
        Ok(())
    }

    /// Hook for stage types that evaluate their own expressions.
    ///
    /// Returning `false` skips [`process_default_entries`] for this stage.
    ///
    /// [`process_default_entries`]: crate::expressions::process_default_entries
    fn process_expressions(
        &self,
        _stage: &mut StageExecution,
        _processor: &ContextParameterProcessor,
        _summary: &mut ExpressionEvaluationSummary,
    ) -> bool {
        true
    }

    /// Context keys left untouched by generic expression evaluation.
    fn expression_exclusions(&self) -> &[&str] {
        &[]
    }

    /// Whether users may skip a running stage of this type.
    fn can_manually_skip(&self) -> bool {
        false
    }
}
