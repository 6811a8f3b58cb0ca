//! Clients for the services stages talk to.
//!
//! Only the interfaces live here. Deployments provide HTTP-backed
//! implementations; tests use the generated mocks.

use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Progress of a submitted cloud operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// The operation finished, successfully or not.
    pub completed: bool,
    /// The operation failed.
    pub failed: bool,
    /// Last status message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// State of a cloud job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Still running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
    /// The provider does not know.
    Unknown,
}

/// A condition holding back a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition name.
    pub name: String,
    /// Human-readable reason.
    pub description: String,
}

impl Condition {
    /// Creates a new condition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Cloud operations (kato).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KatoService: Send + Sync {
    /// Submits an operation and returns its task id.
    async fn submit_operation(&self, cloud_provider: &str, operation: Value) -> Result<String, ServiceError>;

    /// Looks up the status of a submitted operation.
    async fn operation_status(&self, task_id: &str) -> Result<OperationStatus, ServiceError>;

    /// Starts a job and returns its id.
    async fn run_job(&self, cloud_provider: &str, account: &str, region: &str, job: Value)
        -> Result<String, ServiceError>;

    /// Looks up the state of a job.
    async fn job_status(&self, account: &str, region: &str, job_id: &str) -> Result<JobState, ServiceError>;

    /// Cancels a job.
    async fn cancel_job(&self, account: &str, region: &str, job_id: &str) -> Result<(), ServiceError>;
}

/// Pipeline and template storage (front50).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Front50Service: Send + Sync {
    /// Pipelines that depend on a template.
    async fn pipeline_template_dependents(&self, template_id: &str, recursive: bool)
        -> Result<Vec<Value>, ServiceError>;

    /// Replaces a pipeline template.
    async fn update_pipeline_template(&self, template_id: &str, template: Value) -> Result<(), ServiceError>;

    /// Saves a pipeline definition.
    async fn save_pipeline(&self, pipeline: Value) -> Result<(), ServiceError>;
}

/// Source of conditions blocking a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConditionSupplier: Send + Sync {
    /// Conditions that are currently unmet.
    async fn conditions(&self, cluster: &str, region: &str, account: &str) -> Result<Vec<Condition>, ServiceError>;
}
