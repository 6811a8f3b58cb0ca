//! In-memory execution repository.

use super::ExecutionRepository;
use crate::core::{EpochMillis, ExecutionStatus, ExecutionType};
use crate::errors::RepositoryError;
use crate::model::{PipelineExecution, StageExecution};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Keeps executions in a concurrent map keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<String, PipelineExecution>,
}

impl InMemoryExecutionRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    fn update<F>(&self, execution_type: ExecutionType, id: &str, f: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut PipelineExecution),
    {
        match self.executions.get_mut(id) {
            Some(mut entry) if entry.execution_type == execution_type => {
                f(&mut entry);
                Ok(())
            }
            _ => Err(not_found(execution_type, id)),
        }
    }

    fn update_stage<F>(&self, stage: &StageExecution, f: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut PipelineExecution) -> Result<(), RepositoryError>,
    {
        let mut entry = self
            .executions
            .get_mut(&stage.execution_id)
            .ok_or_else(|| RepositoryError::OrphanStage {
                stage_id: stage.id.clone(),
                execution_id: stage.execution_id.clone(),
            })?;
        f(&mut entry)
    }
}

fn not_found(execution_type: ExecutionType, id: &str) -> RepositoryError {
    RepositoryError::NotFound {
        execution_type,
        id: id.to_string(),
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        debug!(execution_id = %execution.id, status = %execution.status, "Storing execution");
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn store_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        self.update_stage(stage, |execution| {
            let slot = execution
                .stage_mut(&stage.id)
                .ok_or_else(|| RepositoryError::OrphanStage {
                    stage_id: stage.id.clone(),
                    execution_id: stage.execution_id.clone(),
                })?;
            *slot = stage.clone();
            Ok(())
        })
    }

    async fn add_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        self.update_stage(stage, |execution| {
            if let Some(slot) = execution.stage_mut(&stage.id) {
                *slot = stage.clone();
                return Ok(());
            }
            execution
                .insert_synthetic(stage.clone())
                .map_err(|_| RepositoryError::OrphanStage {
                    stage_id: stage.id.clone(),
                    execution_id: stage.execution_id.clone(),
                })
        })
    }

    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        self.update(execution_type, id, |execution| execution.status = status)
    }

    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<String>,
        reason: Option<String>,
    ) -> Result<(), RepositoryError> {
        self.update(execution_type, id, |execution| {
            execution.cancel(user.as_deref(), reason.as_deref());
        })
    }

    async fn pause(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<String>,
        now: EpochMillis,
    ) -> Result<(), RepositoryError> {
        self.update(execution_type, id, |execution| execution.pause(user.as_deref(), now))
    }

    async fn resume(&self, execution_type: ExecutionType, id: &str, now: EpochMillis) -> Result<(), RepositoryError> {
        self.update(execution_type, id, |execution| execution.resume(now))
    }

    async fn retrieve(&self, execution_type: ExecutionType, id: &str) -> Result<PipelineExecution, RepositoryError> {
        self.executions
            .get(id)
            .filter(|e| e.execution_type == execution_type)
            .map(|e| e.value().clone())
            .ok_or_else(|| not_found(execution_type, id))
    }

    async fn retrieve_by_application(
        &self,
        execution_type: ExecutionType,
        application: &str,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        let mut executions: Vec<PipelineExecution> = self
            .executions
            .iter()
            .filter(|e| e.execution_type == execution_type && e.application == application)
            .map(|e| e.value().clone())
            .collect();
        executions.sort_by(|a, b| b.build_time.cmp(&a.build_time).then_with(|| b.id.cmp(&a.id)));
        Ok(executions)
    }

    async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<(), RepositoryError> {
        self.executions
            .remove_if(id, |_, e| e.execution_type == execution_type)
            .map(|_| ())
            .ok_or_else(|| not_found(execution_type, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContextMap, SyntheticStageOwner};
    use pretty_assertions::assert_eq;

    fn execution() -> PipelineExecution {
        PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(StageExecution::new("", "wait", "Wait", ContextMap::new()).with_ref_id("1"))
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let repo = InMemoryExecutionRepository::new();
        let execution = execution();
        repo.store(&execution).await.unwrap();

        let loaded = repo.retrieve(ExecutionType::Pipeline, &execution.id).await.unwrap();
        assert_eq!(loaded.id, execution.id);
        assert_eq!(repo.len(), 1);

        let err = repo.retrieve(ExecutionType::Orchestration, &execution.id).await.unwrap_err();
        assert_eq!(err.to_string(), format!("No orchestration found for {}", execution.id));
    }

    #[tokio::test]
    async fn test_store_stage_replaces_by_id() {
        let repo = InMemoryExecutionRepository::new();
        let execution = execution();
        repo.store(&execution).await.unwrap();

        let mut stage = execution.stages[0].clone();
        stage.status = ExecutionStatus::Running;
        repo.store_stage(&stage).await.unwrap();

        let loaded = repo.retrieve(ExecutionType::Pipeline, &execution.id).await.unwrap();
        assert_eq!(loaded.stages[0].status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_store_stage_for_unknown_execution() {
        let repo = InMemoryExecutionRepository::new();
        let stage = StageExecution::new("missing", "wait", "Wait", ContextMap::new());

        let err = repo.store_stage(&stage).await.unwrap_err();
        assert!(matches!(err, RepositoryError::OrphanStage { .. }));
    }

    #[tokio::test]
    async fn test_add_stage_inserts_before_parent() {
        let repo = InMemoryExecutionRepository::new();
        let execution = execution();
        repo.store(&execution).await.unwrap();

        let parent = &execution.stages[0];
        let child = StageExecution::new(execution.id.clone(), "disableCluster", "disable", ContextMap::new())
            .with_ref_id("1<1")
            .with_parent(parent.id.clone(), SyntheticStageOwner::Before);
        repo.add_stage(&child).await.unwrap();

        let loaded = repo.retrieve(ExecutionType::Pipeline, &execution.id).await.unwrap();
        let types: Vec<&str> = loaded.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert_eq!(types, vec!["disableCluster", "wait"]);
    }

    #[tokio::test]
    async fn test_status_cancel_pause_resume() {
        let repo = InMemoryExecutionRepository::new();
        let execution = execution();
        let id = execution.id.clone();
        repo.store(&execution).await.unwrap();

        repo.update_status(ExecutionType::Pipeline, &id, ExecutionStatus::Running)
            .await
            .unwrap();
        repo.pause(ExecutionType::Pipeline, &id, Some("alice".into()), 1_000)
            .await
            .unwrap();
        assert_eq!(
            repo.retrieve(ExecutionType::Pipeline, &id).await.unwrap().status,
            ExecutionStatus::Paused
        );
        repo.resume(ExecutionType::Pipeline, &id, 4_000).await.unwrap();

        let loaded = repo.retrieve(ExecutionType::Pipeline, &id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.paused.map(|p| p.paused_ms), Some(3_000));

        assert!(!repo.is_canceled(ExecutionType::Pipeline, &id).await.unwrap());
        repo.cancel(ExecutionType::Pipeline, &id, Some("bob".into()), None)
            .await
            .unwrap();
        assert!(repo.is_canceled(ExecutionType::Pipeline, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retrieve_by_application_and_delete() {
        let repo = InMemoryExecutionRepository::new();
        let first = execution();
        let other = PipelineExecution::new(ExecutionType::Pipeline, "other");
        repo.store(&first).await.unwrap();
        repo.store(&other).await.unwrap();

        let found = repo
            .retrieve_by_application(ExecutionType::Pipeline, "app")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        repo.delete(ExecutionType::Pipeline, &first.id).await.unwrap();
        assert!(repo.delete(ExecutionType::Pipeline, &first.id).await.is_err());
        assert_eq!(repo.len(), 1);
    }
}
