//! Test fixtures for running executions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::TaskRunnerConfig;
use crate::core::{ContextMap, ExecutionType};
use crate::events::CollectingEventSink;
use crate::expressions::{ContextParameterProcessor, PlaceholderEvaluator};
use crate::graph::{StageDefinitionBuilder, StagePlanner, StageResolver};
use crate::model::{PipelineExecution, StageExecution};
use crate::repository::InMemoryExecutionRepository;
use crate::runner::{ExecutionRunner, ManualClock, TaskRunner};
use crate::tasks::{Task, TaskResolver};

/// Start time of the fixture clock.
pub const FIXTURE_START_MILLIS: i64 = 1_700_000_000_000;

/// A fully wired runner backed by in-memory collaborators.
///
/// The clock is manual, so backoffs complete instantly while still
/// advancing time.
#[derive(Debug)]
pub struct TestFixture {
    /// Simulated time.
    pub clock: Arc<ManualClock>,
    /// Execution storage.
    pub repository: Arc<InMemoryExecutionRepository>,
    /// Collected lifecycle events.
    pub events: Arc<CollectingEventSink>,
    /// Registered stage definitions.
    pub stages: Arc<StageResolver>,
    /// Registered tasks.
    pub tasks: Arc<TaskResolver>,
    config: TaskRunnerConfig,
}

impl TestFixture {
    /// Creates a fixture with empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new(FIXTURE_START_MILLIS)),
            repository: Arc::new(InMemoryExecutionRepository::new()),
            events: Arc::new(CollectingEventSink::new()),
            stages: Arc::new(StageResolver::new()),
            tasks: Arc::new(TaskResolver::new()),
            config: TaskRunnerConfig::default(),
        }
    }

    /// Replaces the task runner configuration.
    #[must_use]
    pub fn with_config(mut self, config: TaskRunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a stage definition.
    ///
    /// # Panics
    ///
    /// Panics if the type is already registered.
    #[must_use]
    pub fn with_stage(self, definition: impl StageDefinitionBuilder + 'static) -> Self {
        if let Err(err) = self.stages.register(Arc::new(definition)) {
            panic!("{err}");
        }
        self
    }

    /// Registers a task.
    #[must_use]
    pub fn with_task(self, task: Arc<dyn Task>) -> Self {
        self.tasks.register(task);
        self
    }

    /// Builds a runner sharing this fixture's collaborators.
    #[must_use]
    pub fn runner(&self) -> ExecutionRunner {
        let planner = StagePlanner::new(
            self.stages.clone(),
            ContextParameterProcessor::new(Arc::new(PlaceholderEvaluator::new())),
        );
        let task_runner = TaskRunner::new(self.tasks.clone(), self.clock.clone(), self.config.clone());
        ExecutionRunner::new(
            self.repository.clone(),
            planner,
            task_runner,
            self.clock.clone(),
            self.events.clone(),
        )
    }

    /// Milliseconds elapsed on the fixture clock.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        use crate::runner::Clock;
        let elapsed = self.clock.now_millis() - FIXTURE_START_MILLIS;
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a top-level stage.
///
/// # Panics
///
/// Panics if `context` is not a JSON object.
#[must_use]
pub fn stage(stage_type: &str, ref_id: &str, requisites: &[&str], context: Value) -> StageExecution {
    let context: ContextMap = match context {
        Value::Object(map) => map,
        Value::Null => ContextMap::new(),
        other => panic!("stage context must be an object, got {other}"),
    };
    StageExecution::new("", stage_type, stage_type, context)
        .with_ref_id(ref_id)
        .with_requisites(requisites.iter().copied())
}

/// Builds a pipeline execution from stages.
#[must_use]
pub fn pipeline(application: &str, stages: Vec<StageExecution>) -> PipelineExecution {
    stages.into_iter().fold(
        PipelineExecution::new(ExecutionType::Pipeline, application),
        PipelineExecution::with_stage,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStageDefinition;
    use serde_json::json;

    #[test]
    fn test_pipeline_builder_links_stages() {
        let execution = pipeline(
            "app",
            vec![
                stage("wait", "1", &[], json!({"waitTime": 1})),
                stage("wait", "2", &["1"], Value::Null),
            ],
        );
        assert_eq!(execution.stages.len(), 2);
        assert_eq!(execution.stages[1].requisite_stage_ref_ids, vec!["1".to_string()]);
        assert!(execution.stages.iter().all(|s| s.execution_id == execution.id));
    }

    #[test]
    fn test_fixture_registers() {
        let fixture = TestFixture::new().with_stage(MockStageDefinition::new("noop"));
        assert!(fixture.stages.contains("noop"));
        assert_eq!(fixture.elapsed(), Duration::ZERO);
        let _runner = fixture.runner();
    }
}
