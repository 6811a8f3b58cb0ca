//! Persistence of executions.
//!
//! The runner writes through an [`ExecutionRepository`] after every state
//! change, so a repository always holds the latest known state of each
//! execution and its stages.

mod memory;

pub use memory::InMemoryExecutionRepository;

use crate::core::{EpochMillis, ExecutionStatus, ExecutionType};
use crate::errors::RepositoryError;
use crate::model::{PipelineExecution, StageExecution};
use async_trait::async_trait;

/// Stores executions and their stages.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Inserts or replaces a whole execution.
    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError>;

    /// Replaces one stage of a stored execution.
    async fn store_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError>;

    /// Adds a synthetic stage next to its parent.
    async fn add_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError>;

    /// Updates the status of an execution.
    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError>;

    /// Marks an execution as canceled.
    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<String>,
        reason: Option<String>,
    ) -> Result<(), RepositoryError>;

    /// Marks an execution as paused.
    async fn pause(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<String>,
        now: EpochMillis,
    ) -> Result<(), RepositoryError>;

    /// Resumes a paused execution.
    async fn resume(&self, execution_type: ExecutionType, id: &str, now: EpochMillis) -> Result<(), RepositoryError>;

    /// Loads an execution.
    async fn retrieve(&self, execution_type: ExecutionType, id: &str) -> Result<PipelineExecution, RepositoryError>;

    /// Returns true if the execution was canceled.
    async fn is_canceled(&self, execution_type: ExecutionType, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.retrieve(execution_type, id).await?.is_canceled)
    }

    /// Loads every execution of an application, newest first.
    async fn retrieve_by_application(
        &self,
        execution_type: ExecutionType,
        application: &str,
    ) -> Result<Vec<PipelineExecution>, RepositoryError>;

    /// Deletes an execution.
    async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<(), RepositoryError>;
}
