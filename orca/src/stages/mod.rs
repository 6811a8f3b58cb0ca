//! Built-in stage types and their tasks.
//!
//! [`default_stage_resolver`] and [`default_task_resolver`] register every
//! stage type in this module against the given [`StageServices`].

mod cluster;
mod condition;
mod job;
mod template;
mod variables;
mod wait;

pub use cluster::{ClusterOperationTask, DisableClusterStage, MonitorKatoTask, ShrinkClusterStage, LAST_KATO_TASK_ID};
pub use condition::{EvaluateConditionTask, WaitForConditionStage, CONDITION_STATUS};
pub use job::{MonitorJobTask, RunJobStage, RunJobTask, JOB_ID};
pub use template::{
    pipeline_template_of, PlanTemplateDependentsTask, UpdatePipelineStage, UpdatePipelineTask,
    UpdatePipelineTemplateStage, UpdatePipelineTemplateTask,
};
pub use variables::{EvaluateVariablesStage, EvaluateVariablesTask};
pub use wait::{WaitStage, WaitTask};

use crate::errors::GraphValidationError;
use crate::graph::StageResolver;
use crate::runner::Clock;
use crate::services::{ConditionSupplier, Front50Service, KatoService};
use crate::tasks::TaskResolver;
use std::sync::Arc;

/// External services the built-in stages call.
#[derive(Clone)]
pub struct StageServices {
    /// Cloud operations.
    pub kato: Arc<dyn KatoService>,
    /// Pipeline and template storage.
    pub front50: Arc<dyn Front50Service>,
    /// Deployment conditions.
    pub conditions: Arc<dyn ConditionSupplier>,
}

impl std::fmt::Debug for StageServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageServices").finish_non_exhaustive()
    }
}

/// Creates a resolver with every built-in stage type registered.
pub fn default_stage_resolver(services: &StageServices) -> Result<StageResolver, GraphValidationError> {
    let resolver = StageResolver::new();
    resolver.register(Arc::new(ShrinkClusterStage))?;
    resolver.register(Arc::new(DisableClusterStage))?;
    resolver.register(Arc::new(UpdatePipelineTemplateStage::new(services.front50.clone())))?;
    resolver.register(Arc::new(UpdatePipelineStage))?;
    resolver.register(Arc::new(RunJobStage))?;
    resolver.register(Arc::new(WaitForConditionStage))?;
    resolver.register(Arc::new(EvaluateVariablesStage))?;
    resolver.register(Arc::new(WaitStage))?;
    Ok(resolver)
}

/// Creates a resolver with every built-in task registered.
#[must_use]
pub fn default_task_resolver(services: &StageServices, clock: Arc<dyn Clock>) -> TaskResolver {
    let resolver = TaskResolver::new();
    resolver.register(Arc::new(ClusterOperationTask::shrink(services.kato.clone())));
    resolver.register(Arc::new(ClusterOperationTask::disable(services.kato.clone())));
    resolver.register(Arc::new(MonitorKatoTask::new(services.kato.clone())));
    resolver.register(Arc::new(UpdatePipelineTemplateTask::new(services.front50.clone())));
    resolver.register(Arc::new(PlanTemplateDependentsTask::new(services.front50.clone())));
    resolver.register(Arc::new(UpdatePipelineTask::new(services.front50.clone())));
    resolver.register(Arc::new(RunJobTask::new(services.kato.clone())));
    resolver.register(Arc::new(MonitorJobTask::new(services.kato.clone())));
    resolver.register(Arc::new(EvaluateConditionTask::new(services.conditions.clone())));
    resolver.register(Arc::new(EvaluateVariablesTask));
    resolver.register(Arc::new(WaitTask::new(clock)));
    resolver
}
