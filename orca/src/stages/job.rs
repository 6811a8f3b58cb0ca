//! Runs a one-off job and monitors it to completion.

use crate::core::{ExecutionStatus, TaskResult};
use crate::errors::TaskError;
use crate::graph::{StageDefinitionBuilder, TaskGraphBuilder};
use crate::model::StageExecution;
use crate::services::{JobState, KatoService};
use crate::tasks::{cloud_provider_of, credentials_of, required_str, RetrySchedule, Task};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Context key holding the id of the submitted job.
pub const JOB_ID: &str = "jobId";

/// Runs a job and waits for it to finish.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunJobStage;

impl RunJobStage {
    /// Stage type key.
    pub const TYPE: &'static str = "runJob";
}

impl StageDefinitionBuilder for RunJobStage {
    fn stage_type(&self) -> &str {
        Self::TYPE
    }

    fn task_graph(&self, _stage: &StageExecution, tasks: &mut TaskGraphBuilder) {
        tasks
            .with_task("runJob", RunJobTask::TYPE)
            .with_task("monitorJob", MonitorJobTask::TYPE);
    }

    fn can_manually_skip(&self) -> bool {
        true
    }
}

struct JobLocation {
    account: String,
    region: String,
}

impl JobLocation {
    fn of(stage: &StageExecution) -> Result<Self, TaskError> {
        let account = credentials_of(stage)
            .ok_or_else(|| TaskError::InvalidContext("missing 'credentials'".to_string()))?;
        let region = required_str(stage, "region")?.to_string();
        Ok(Self { account, region })
    }
}

/// Submits the job described by the `job` context entry.
pub struct RunJobTask {
    kato: Arc<dyn KatoService>,
}

impl std::fmt::Debug for RunJobTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunJobTask").finish_non_exhaustive()
    }
}

impl RunJobTask {
    /// Task type key.
    pub const TYPE: &'static str = "runJob";

    /// Creates a new task.
    #[must_use]
    pub fn new(kato: Arc<dyn KatoService>) -> Self {
        Self { kato }
    }
}

#[async_trait]
impl Task for RunJobTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let location = JobLocation::of(stage)?;
        let job = stage
            .context
            .get("job")
            .filter(|job| job.is_object())
            .cloned()
            .ok_or_else(|| TaskError::InvalidContext("missing 'job'".to_string()))?;
        let cloud_provider = cloud_provider_of(stage);

        let job_id = self
            .kato
            .run_job(&cloud_provider, &location.account, &location.region, job)
            .await?;
        info!(
            stage_id = %stage.id,
            job_id = %job_id,
            account = %location.account,
            region = %location.region,
            "Submitted job"
        );

        Ok(TaskResult::succeeded()
            .with_context_entry("notification.type", "runjob")
            .with_context_entry(JOB_ID, job_id.clone())
            .with_output(JOB_ID, job_id))
    }

    fn is_cloud_provider_aware(&self) -> bool {
        true
    }
}

/// Polls the job until it reaches a final state.
///
/// Cancellation and timeout both cancel the outstanding job. A job that no
/// longer exists counts as canceled.
pub struct MonitorJobTask {
    kato: Arc<dyn KatoService>,
}

impl std::fmt::Debug for MonitorJobTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorJobTask").finish_non_exhaustive()
    }
}

impl MonitorJobTask {
    /// Task type key.
    pub const TYPE: &'static str = "monitorJob";

    /// Creates a new task.
    #[must_use]
    pub fn new(kato: Arc<dyn KatoService>) -> Self {
        Self { kato }
    }

    /// Cancels the stage's job, if one was submitted.
    async fn cancel_outstanding_job(&self, stage: &StageExecution) -> JobCancellation {
        let Some(job_id) = stage.context_str(JOB_ID) else {
            return JobCancellation::NotSubmitted;
        };
        let location = match JobLocation::of(stage) {
            Ok(location) => location,
            Err(err) => {
                warn!(stage_id = %stage.id, job_id, error = %err, "Cannot locate job to cancel");
                return JobCancellation::Failed(err.to_string());
            }
        };

        match self.kato.cancel_job(&location.account, &location.region, job_id).await {
            Ok(()) => {
                info!(stage_id = %stage.id, job_id, "Canceled job");
                JobCancellation::Canceled
            }
            Err(err) if err.is_not_found() => {
                info!(stage_id = %stage.id, job_id, "Job already gone");
                JobCancellation::Canceled
            }
            Err(err) => {
                warn!(stage_id = %stage.id, job_id, error = %err, "Failed to cancel job");
                JobCancellation::Failed(err.to_string())
            }
        }
    }
}

/// What happened to a job when its task was stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobCancellation {
    NotSubmitted,
    Canceled,
    /// The job may still be running.
    Failed(String),
}

#[async_trait]
impl Task for MonitorJobTask {
    fn task_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let job_id = required_str(stage, JOB_ID)?;
        let location = JobLocation::of(stage)?;

        let state = self.kato.job_status(&location.account, &location.region, job_id).await?;
        let result = match state {
            JobState::Succeeded => TaskResult::succeeded(),
            JobState::Failed => TaskResult::terminal().with_context_entry(
                "exception",
                json!({
                    "exceptionType": "JobFailed",
                    "details": {"error": format!("Job {job_id} failed")},
                    "shouldRetry": false,
                }),
            ),
            JobState::Running | JobState::Unknown => TaskResult::running(),
        };
        Ok(result.with_context_entry("jobStatus", serde_json::to_value(state).unwrap_or(Value::Null)))
    }

    fn retry_schedule(&self) -> Option<RetrySchedule> {
        Some(RetrySchedule::new(Duration::from_secs(10), Duration::from_secs(2 * 60 * 60)).overridable())
    }

    async fn on_timeout(&self, stage: &StageExecution) -> Option<TaskResult> {
        self.cancel_outstanding_job(stage).await;
        None
    }

    async fn on_cancel(&self, stage: &StageExecution) -> Option<TaskResult> {
        match self.cancel_outstanding_job(stage).await {
            JobCancellation::NotSubmitted => None,
            JobCancellation::Canceled => {
                Some(TaskResult::with_status(ExecutionStatus::Canceled).with_context_entry("jobCanceled", true))
            }
            JobCancellation::Failed(error) => {
                Some(TaskResult::with_status(ExecutionStatus::Canceled).with_context_entry("jobCancelError", error))
            }
        }
    }
}
