//! One attempt of one task.
//!
//! The [`TaskRunner`] decides, for a single invocation, whether the task
//! should run at all (cancellation, pause, manual skip, timeouts), runs it
//! against the stage's merged context, and translates the result or error
//! into a [`RunOutcome`]. It never mutates the execution; the caller applies
//! the returned [`TaskAttempt`] under its own lock.

use super::clock::{to_millis, Clock};
use crate::config::TaskRunnerConfig;
use crate::core::{ContextMap, ExecutionStatus, TaskResult};
use crate::errors::{exception_details, GraphValidationError, OrcaError, TaskError};
use crate::model::{context_keys, PipelineExecution, StageExecution, TaskExecution};
use crate::observability::{SpanTimer, StageSpanAttributes};
use crate::tasks::{cloud_provider_of, credentials_of, Task, TaskResolver};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Stage type whose tasks are exempt from timeouts.
pub const RESTRICT_EXECUTION_WINDOW_TYPE: &str = "restrictExecutionDuringTimeWindow";

/// What the caller should do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Invoke the task again after the delay.
    Reschedule(Duration),
    /// The task is finished with this status.
    Complete(ExecutionStatus),
    /// The execution is paused; try again later without running the task.
    Pause,
}

/// The outcome of an attempt plus the stage updates it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAttempt {
    /// What to do next.
    pub outcome: RunOutcome,
    /// Entries to merge into the stage context.
    pub context: ContextMap,
    /// Entries to merge into the stage outputs.
    pub outputs: ContextMap,
}

impl TaskAttempt {
    pub(super) fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            context: ContextMap::new(),
            outputs: ContextMap::new(),
        }
    }

    fn from_result(outcome: RunOutcome, result: TaskResult) -> Self {
        Self {
            outcome,
            context: result.context,
            outputs: result.outputs,
        }
    }

    fn with_context_entry(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Merges the updates into a stage.
    ///
    /// A task may set `stageTimeoutMs` on its own stage but never leaks it
    /// to downstream stages through outputs.
    pub fn apply(&self, stage: &mut StageExecution) {
        for (key, value) in &self.context {
            stage.context.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.outputs {
            if key != context_keys::STAGE_TIMEOUT_MS {
                stage.outputs.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Runs single task attempts.
pub struct TaskRunner {
    tasks: Arc<TaskResolver>,
    clock: Arc<dyn Clock>,
    config: TaskRunnerConfig,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("tasks", &self.tasks)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Creates a new task runner.
    #[must_use]
    pub fn new(tasks: Arc<TaskResolver>, clock: Arc<dyn Clock>, config: TaskRunnerConfig) -> Self {
        Self { tasks, clock, config }
    }

    /// The task registry.
    #[must_use]
    pub fn tasks(&self) -> &TaskResolver {
        &self.tasks
    }

    /// The runner configuration.
    #[must_use]
    pub fn config(&self) -> &TaskRunnerConfig {
        &self.config
    }

    /// Runs one attempt of a task.
    ///
    /// Errors are reserved for problems with the execution itself (unknown
    /// stage, task or task type, or a status a task may not return);
    /// failures of the task become statuses.
    pub async fn run_task(
        &self,
        execution: &PipelineExecution,
        stage_id: &str,
        task_id: &str,
    ) -> Result<TaskAttempt, OrcaError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or_else(|| GraphValidationError::unknown_stage(stage_id))?;
        let task_model = stage.task_by_id(task_id).ok_or_else(|| {
            GraphValidationError::new(format!("Stage {stage_id} has no task {task_id}"))
                .with_stages(vec![stage_id.to_string()])
        })?;
        let task = self.tasks.resolve(&task_model.implementing_type)?;

        let span = StageSpanAttributes::for_stage(stage).with_task(task_model).span();
        self.attempt(execution, stage, task_model, task.as_ref())
            .instrument(span)
            .await
    }

    async fn attempt(
        &self,
        execution: &PipelineExecution,
        stage: &StageExecution,
        task_model: &TaskExecution,
        task: &dyn Task,
    ) -> Result<TaskAttempt, OrcaError> {
        if execution.is_canceled {
            let result = TaskResult::with_status(ExecutionStatus::Canceled).merge(task.on_cancel(stage).await);
            info!(canceled_by = ?execution.canceled_by, "Execution canceled, canceling task");
            return Ok(TaskAttempt::from_result(
                RunOutcome::Complete(ExecutionStatus::Canceled),
                result,
            ));
        }
        if execution.status.is_complete() {
            debug!(status = %execution.status, "Execution already complete, canceling task");
            return Ok(TaskAttempt::new(RunOutcome::Complete(ExecutionStatus::Canceled)));
        }
        if execution.status == ExecutionStatus::Paused {
            return Ok(TaskAttempt::new(RunOutcome::Pause));
        }

        let timer = SpanTimer::start(task.task_type());
        let attempt = match self.check_for_timeout(execution, stage, task_model, task) {
            Err(message) => self.handle_timeout(stage, task, &message).await,
            Ok(()) => self.execute(execution, stage, task_model, task).await?,
        };

        let elapsed = timer.finish();
        if elapsed >= self.config.warning_invocation_time() {
            warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                outcome = ?attempt.outcome,
                "Task invocation took longer than expected"
            );
        }
        Ok(attempt)
    }

    async fn execute(
        &self,
        execution: &PipelineExecution,
        stage: &StageExecution,
        task_model: &TaskExecution,
        task: &dyn Task,
    ) -> Result<TaskAttempt, OrcaError> {
        let merged = execution
            .stage_with_merged_context(&stage.id)
            .ok_or_else(|| GraphValidationError::unknown_stage(&stage.id))?;

        let result = match task.execute(&merged).await {
            Ok(result) => result,
            Err(err) => return Ok(self.handle_error(&merged, task_model, task, &err)),
        };

        let attempt = match result.status {
            ExecutionStatus::Running => {
                let backoff = self.backoff_period(&merged, task_model, task);
                debug!(backoff_ms = to_millis(backoff), "Task still running");
                TaskAttempt::from_result(RunOutcome::Reschedule(backoff), result)
            }
            status @ (ExecutionStatus::Succeeded
            | ExecutionStatus::Redirect
            | ExecutionStatus::Skipped
            | ExecutionStatus::FailedContinue
            | ExecutionStatus::Stopped) => TaskAttempt::from_result(RunOutcome::Complete(status), result),
            ExecutionStatus::Canceled => {
                let result = result.merge(task.on_cancel(stage).await);
                let status = stage.failure_status(ExecutionStatus::Canceled);
                TaskAttempt::from_result(RunOutcome::Complete(status), result)
            }
            ExecutionStatus::Terminal => {
                let status = stage.failure_status(ExecutionStatus::Terminal);
                TaskAttempt::from_result(RunOutcome::Complete(status), result)
            }
            other => {
                return Err(OrcaError::Internal(format!(
                    "Task {} returned unhandled status {other}",
                    task.task_type()
                )))
            }
        };
        Ok(attempt)
    }

    fn handle_error(
        &self,
        stage: &StageExecution,
        task_model: &TaskExecution,
        task: &dyn Task,
        err: &TaskError,
    ) -> TaskAttempt {
        if err.is_retryable() {
            let backoff = self.backoff_period(stage, task_model, task);
            warn!(error = %err, backoff_ms = to_millis(backoff), "Retryable task error, rescheduling");
            return TaskAttempt::new(RunOutcome::Reschedule(backoff));
        }

        if err.is_user_error() {
            warn!(error = %err, "Task failed on invalid input");
        } else {
            error!(error = %err, "Task failed");
        }
        let status = stage.failure_status(ExecutionStatus::Terminal);
        TaskAttempt::new(RunOutcome::Complete(status))
            .with_context_entry(context_keys::EXCEPTION, err.to_details(task.task_type()))
    }

    async fn handle_timeout(&self, stage: &StageExecution, task: &dyn Task, message: &str) -> TaskAttempt {
        info!(message, "Task timed out");
        match task.on_timeout(stage).await {
            Some(result) if result.status == ExecutionStatus::Terminal => {
                let status = stage.failure_status(ExecutionStatus::Terminal);
                TaskAttempt::from_result(RunOutcome::Complete(status), result)
            }
            Some(result) if result.status == ExecutionStatus::FailedContinue => {
                TaskAttempt::from_result(RunOutcome::Complete(ExecutionStatus::FailedContinue), result)
            }
            Some(result) => {
                error!(status = %result.status, "Task returned an invalid status from on_timeout");
                Self::timeout_failure(stage, message)
            }
            None => Self::timeout_failure(stage, message),
        }
    }

    fn timeout_failure(stage: &StageExecution, message: &str) -> TaskAttempt {
        if stage.context_bool(context_keys::MARK_SUCCESSFUL_ON_TIMEOUT) == Some(true) {
            return TaskAttempt::new(RunOutcome::Complete(ExecutionStatus::Succeeded));
        }
        let status = stage.failure_status(ExecutionStatus::Terminal);
        TaskAttempt::new(RunOutcome::Complete(status)).with_context_entry(
            context_keys::EXCEPTION,
            exception_details("TimeoutException", message, HashMap::new()),
        )
    }

    fn check_for_timeout(
        &self,
        execution: &PipelineExecution,
        stage: &StageExecution,
        task_model: &TaskExecution,
        task: &dyn Task,
    ) -> Result<(), String> {
        if stage.stage_type == RESTRICT_EXECUTION_WINDOW_TYPE {
            return Ok(());
        }
        self.check_for_stage_timeout(execution, stage)?;
        self.check_for_task_timeout(execution, stage, task_model, task)
    }

    fn check_for_stage_timeout(&self, execution: &PipelineExecution, stage: &StageExecution) -> Result<(), String> {
        let Some(parent) = execution.parent_with_timeout(&stage.id) else {
            return Ok(());
        };
        let (Some(start), Some(timeout)) = (parent.start_time, parent.timeout()) else {
            return Ok(());
        };

        let elapsed = self.elapsed_since(start);
        let paused = execution.paused_duration_relative_to(start);
        let window = execution_window_duration(execution, stage, self.clock.now_millis());
        if elapsed.saturating_sub(paused).saturating_sub(window) > timeout {
            return Err(format!(
                "Stage {} timed out after {}",
                stage.name,
                format_duration_words(elapsed)
            ));
        }
        Ok(())
    }

    fn check_for_task_timeout(
        &self,
        execution: &PipelineExecution,
        stage: &StageExecution,
        task_model: &TaskExecution,
        task: &dyn Task,
    ) -> Result<(), String> {
        let (Some(schedule), Some(start)) = (task.retry_schedule(), task_model.start_time) else {
            return Ok(());
        };

        let paused = execution.paused_duration_relative_to(start);
        let elapsed = self.elapsed_since(start);
        let stage_timeout = execution
            .parent_with_timeout(&stage.id)
            .and_then(StageExecution::timeout);
        let timeout = match stage_timeout {
            Some(timeout) if schedule.timeout_overridable => Some(timeout),
            _ => task.dynamic_timeout(stage),
        };
        let Some(timeout) = timeout else {
            return Ok(());
        };

        if elapsed.saturating_sub(paused) > timeout {
            return Err(format!(
                "{} of stage {} timed out after {}. pausedDuration: {}, elapsedTime: {}, timeoutValue: {}",
                task.task_type(),
                stage.name,
                format_duration_words(elapsed),
                format_duration_words(paused),
                format_duration_words(elapsed),
                format_duration_words(timeout)
            ));
        }
        Ok(())
    }

    /// Backoff before the next attempt.
    ///
    /// Plain tasks use the configured default. Retryable tasks use the
    /// longest of their own backoff and every configured override that
    /// applies, capped by the configured maximum.
    #[must_use]
    pub fn backoff_period(&self, stage: &StageExecution, task_model: &TaskExecution, task: &dyn Task) -> Duration {
        if task.retry_schedule().is_none() {
            return self.config.default_backoff();
        }

        let elapsed = self.elapsed_since(task_model.start_time.unwrap_or(0));
        let mut backoff = task
            .dynamic_backoff_period(stage, elapsed)
            .unwrap_or_else(|| self.config.default_backoff());

        let (provider, account) = if task.is_cloud_provider_aware() {
            (Some(cloud_provider_of(stage)), credentials_of(stage))
        } else {
            (None, None)
        };
        for configured in self.config.configured_backoffs(provider.as_deref(), account.as_deref()) {
            backoff = backoff.max(configured);
        }
        if let Some(max) = self.config.max_backoff() {
            backoff = backoff.min(max);
        }
        backoff
    }

    fn elapsed_since(&self, start: i64) -> Duration {
        let elapsed = self.clock.now_millis().saturating_sub(start);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }
}

fn execution_window_duration(execution: &PipelineExecution, stage: &StageExecution, now: i64) -> Duration {
    execution
        .before_stages_of(&stage.id)
        .into_iter()
        .find(|s| s.stage_type == RESTRICT_EXECUTION_WINDOW_TYPE)
        .and_then(|window| {
            let start = window.start_time?;
            let end = window.end_time.unwrap_or(now);
            u64::try_from(end - start).ok()
        })
        .map_or(Duration::ZERO, Duration::from_millis)
}

/// Formats a duration as words, e.g. `1 hour 5 minutes 1 second`.
#[must_use]
pub fn format_duration_words(duration: Duration) -> String {
    const UNITS: [(u64, &str); 4] = [(86_400, "day"), (3_600, "hour"), (60, "minute"), (1, "second")];

    let mut remaining = duration.as_secs();
    if remaining == 0 {
        return format!("{} milliseconds", duration.as_millis());
    }
    let mut parts = Vec::new();
    for (size, unit) in UNITS {
        let count = remaining / size;
        remaining %= size;
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {unit}{plural}"));
        }
    }
    parts.join(" ")
}
