//! Scripted tasks and stage definitions for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::{ContextMap, EpochMillis, ExecutionStatus, TaskResult};
use crate::errors::{OrcaError, TaskError};
use crate::graph::{StageDefinitionBuilder, StageGraphBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::runner::Clock;
use crate::tasks::{RetrySchedule, Task};

/// One scripted response of a [`MockTask`].
#[derive(Debug)]
pub enum ScriptedStep {
    /// Return this result.
    Result(TaskResult),
    /// Fail with this error.
    Error(TaskError),
}

/// A task that replays scripted steps and counts its invocations.
///
/// Once the script is exhausted every attempt succeeds. `on_cancel`
/// returns a result with `canceled: true` in its context.
pub struct MockTask {
    task_type: String,
    steps: Mutex<VecDeque<ScriptedStep>>,
    schedule: Option<RetrySchedule>,
    cloud_provider_aware: bool,
    timeout_result: Option<TaskResult>,
    clock: Option<Arc<dyn Clock>>,
    execute_count: Mutex<usize>,
    cancel_count: Mutex<usize>,
    timeout_count: Mutex<usize>,
    invocation_times: Mutex<Vec<EpochMillis>>,
    contexts: Mutex<Vec<ContextMap>>,
}

impl std::fmt::Debug for MockTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTask")
            .field("task_type", &self.task_type)
            .field("schedule", &self.schedule)
            .field("execute_count", &self.execute_count())
            .finish_non_exhaustive()
    }
}

impl MockTask {
    /// Creates a plain task that always succeeds.
    #[must_use]
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            steps: Mutex::new(VecDeque::new()),
            schedule: None,
            cloud_provider_aware: false,
            timeout_result: None,
            clock: None,
            execute_count: Mutex::new(0),
            cancel_count: Mutex::new(0),
            timeout_count: Mutex::new(0),
            invocation_times: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Sets the scripted steps.
    #[must_use]
    pub fn with_steps(self, steps: Vec<ScriptedStep>) -> Self {
        *self.steps.lock() = steps.into();
        self
    }

    /// Returns RUNNING `times` times, then succeeds.
    #[must_use]
    pub fn running_then_success(self, times: usize) -> Self {
        let steps = (0..times).map(|_| ScriptedStep::Result(TaskResult::running())).collect();
        self.with_steps(steps)
    }

    /// Makes the task retryable.
    #[must_use]
    pub fn with_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Opts into per-provider and per-account backoffs.
    #[must_use]
    pub fn cloud_provider_aware(mut self) -> Self {
        self.cloud_provider_aware = true;
        self
    }

    /// Sets the result of `on_timeout`.
    #[must_use]
    pub fn with_timeout_result(mut self, result: TaskResult) -> Self {
        self.timeout_result = Some(result);
        self
    }

    /// Records the clock time of each invocation.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Number of `execute` calls.
    #[must_use]
    pub fn execute_count(&self) -> usize {
        *self.execute_count.lock()
    }

    /// Number of `on_cancel` calls.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        *self.cancel_count.lock()
    }

    /// Number of `on_timeout` calls.
    #[must_use]
    pub fn timeout_count(&self) -> usize {
        *self.timeout_count.lock()
    }

    /// Clock times of each `execute` call, if a clock was given.
    #[must_use]
    pub fn invocation_times(&self) -> Vec<EpochMillis> {
        self.invocation_times.lock().clone()
    }

    /// The merged context seen by each `execute` call.
    #[must_use]
    pub fn recorded_contexts(&self) -> Vec<ContextMap> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl Task for MockTask {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        *self.execute_count.lock() += 1;
        if let Some(clock) = &self.clock {
            self.invocation_times.lock().push(clock.now_millis());
        }
        self.contexts.lock().push(stage.context.clone());

        let step = self.steps.lock().pop_front();
        match step {
            Some(ScriptedStep::Result(result)) => Ok(result),
            Some(ScriptedStep::Error(err)) => Err(err),
            None => Ok(TaskResult::succeeded()),
        }
    }

    fn retry_schedule(&self) -> Option<RetrySchedule> {
        self.schedule
    }

    async fn on_timeout(&self, _stage: &StageExecution) -> Option<TaskResult> {
        *self.timeout_count.lock() += 1;
        self.timeout_result.clone()
    }

    async fn on_cancel(&self, _stage: &StageExecution) -> Option<TaskResult> {
        *self.cancel_count.lock() += 1;
        Some(TaskResult::with_status(ExecutionStatus::Canceled).with_context_entry("canceled", true))
    }

    fn is_cloud_provider_aware(&self) -> bool {
        self.cloud_provider_aware
    }
}

/// A configurable stage definition.
///
/// Synthetic stages are named after their type and chained in the order
/// they were declared.
#[derive(Debug, Clone)]
pub struct MockStageDefinition {
    stage_type: String,
    tasks: Vec<(String, String)>,
    before: Vec<String>,
    after: Vec<String>,
    on_failure: Vec<String>,
}

impl MockStageDefinition {
    /// Creates a definition with no tasks.
    #[must_use]
    pub fn new(stage_type: impl Into<String>) -> Self {
        Self {
            stage_type: stage_type.into(),
            tasks: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    /// Adds a task; the task type doubles as its name.
    #[must_use]
    pub fn with_task(mut self, task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        self.tasks.push((task_type.clone(), task_type));
        self
    }

    /// Adds a before stage of the given type.
    #[must_use]
    pub fn with_before(mut self, stage_type: impl Into<String>) -> Self {
        self.before.push(stage_type.into());
        self
    }

    /// Adds an after stage of the given type.
    #[must_use]
    pub fn with_after(mut self, stage_type: impl Into<String>) -> Self {
        self.after.push(stage_type.into());
        self
    }

    /// Adds a stage that runs when this stage fails.
    #[must_use]
    pub fn with_failure_stage(mut self, stage_type: impl Into<String>) -> Self {
        self.on_failure.push(stage_type.into());
        self
    }
}

fn append_all(types: &[String], graph: &mut StageGraphBuilder) {
    for stage_type in types {
        graph.append(|s| {
            s.stage_type.clone_from(stage_type);
            s.name.clone_from(stage_type);
        });
    }
}

#[async_trait]
impl StageDefinitionBuilder for MockStageDefinition {
    fn stage_type(&self) -> &str {
        &self.stage_type
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        for (name, task_type) in &self.tasks {
            tasks.with_task(name.as_str(), task_type.as_str());
        }
    }

    async fn before_stages(&self, _stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
        append_all(&self.before, graph);
        Ok(())
    }

    async fn after_stages(&self, _stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
        append_all(&self.after, graph);
        Ok(())
    }

    async fn on_failure_stages(&self, _stage: &StageExecution, graph: &mut StageGraphBuilder) -> Result<(), OrcaError> {
        append_all(&self.on_failure, graph);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ManualClock;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_mock_task_replays_script() {
        let clock = Arc::new(ManualClock::new(5));
        let task = MockTask::new("poll")
            .running_then_success(1)
            .with_clock(clock.clone());
        let stage = StageExecution::new("e", "t", "t", ContextMap::new());

        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Running);
        clock.advance(std::time::Duration::from_millis(10));
        assert_eq!(task.execute(&stage).await.unwrap().status, ExecutionStatus::Succeeded);
        assert_eq!(task.execute_count(), 2);
        assert_eq!(task.invocation_times(), vec![5, 15]);
    }

    #[tokio::test]
    async fn test_mock_task_hooks_count() {
        let task = MockTask::new("t").with_steps(vec![ScriptedStep::Error(TaskError::User("no".into()))]);
        let stage = StageExecution::new("e", "t", "t", ContextMap::new());

        assert!(task.execute(&stage).await.is_err());
        assert!(task.on_timeout(&stage).await.is_none());
        assert!(task.on_cancel(&stage).await.is_some());
        assert_eq!((task.timeout_count(), task.cancel_count()), (1, 1));
    }

    #[tokio::test]
    async fn test_mock_definition_declares_graph() {
        let definition = MockStageDefinition::new("parent")
            .with_task("a")
            .with_task("b")
            .with_before("setup");
        let stage = StageExecution::new("e", "parent", "Parent", ContextMap::new()).with_ref_id("1");

        let mut tasks = TaskGraphBuilder::new();
        definition.task_graph(&stage, &mut tasks);
        assert_eq!(tasks.len(), 2);

        let mut graph = StageGraphBuilder::before_stages(&stage);
        definition.before_stages(&stage, &mut graph).await.unwrap();
        let before: Vec<StageExecution> = graph.build().collect();
        assert_eq!(before[0].ref_id.as_deref(), Some("1<1"));
    }
}
