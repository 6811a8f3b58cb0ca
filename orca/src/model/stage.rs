//! Stage execution: one node in the pipeline DAG.

use super::TaskExecution;
use crate::core::{ContextMap, EpochMillis, ExecutionStatus, SyntheticStageOwner};
use crate::errors::GraphValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Well-known stage context keys.
pub mod context_keys {
    /// Overrides the stage timeout, in milliseconds.
    pub const STAGE_TIMEOUT_MS: &str = "stageTimeoutMs";
    /// Overrides the task backoff, in milliseconds.
    pub const BACKOFF_PERIOD_MS: &str = "backoffPeriodMs";
    /// Failure becomes FAILED_CONTINUE.
    pub const CONTINUE_PIPELINE: &str = "continuePipeline";
    /// `false` turns failure into STOPPED.
    pub const FAIL_PIPELINE: &str = "failPipeline";
    /// Timeouts complete the stage successfully.
    pub const MARK_SUCCESSFUL_ON_TIMEOUT: &str = "markSuccessfulOnTimeout";
    /// The stage was skipped by a user.
    pub const MANUAL_SKIP: &str = "manualSkip";
    /// Synthetic siblings keep running after this stage fails.
    pub const ALLOW_SIBLINGS_ON_FAILURE: &str = "allowSiblingStagesToContinueOnFailure";
    /// Failure details written by the runner.
    pub const EXCEPTION: &str = "exception";
    /// Expression failures recorded during planning.
    pub const EXPRESSION_SUMMARY: &str = "expressionEvaluationSummary";
    /// Cloud provider of the stage's target.
    pub const CLOUD_PROVIDER: &str = "cloudProvider";
    /// Account of the stage's target.
    pub const CREDENTIALS: &str = "credentials";
}

use context_keys as keys;

/// A stage in a pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    /// Unique id (UUID v7).
    pub id: String,

    /// Id used by `requisite_stage_ref_ids` to express dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,

    /// Stage type key resolved through the stage registry.
    #[serde(rename = "type")]
    pub stage_type: String,

    /// Display name.
    pub name: String,

    /// Id of the owning execution.
    #[serde(default)]
    pub execution_id: String,

    /// Stage configuration and task-written state.
    #[serde(default)]
    pub context: ContextMap,

    /// Values exposed to downstream stages.
    #[serde(default)]
    pub outputs: ContextMap,

    /// Tasks in execution order.
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,

    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,

    /// Parent stage id for synthetic stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_stage_id: Option<String>,

    /// Position relative to the parent for synthetic stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_stage_owner: Option<SyntheticStageOwner>,

    /// Ref ids of the stages that must complete first.
    #[serde(default)]
    pub requisite_stage_ref_ids: Vec<String>,

    /// When the stage started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<EpochMillis>,

    /// When the stage completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<EpochMillis>,
}

impl StageExecution {
    /// Creates a new stage with a fresh id.
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        stage_type: impl Into<String>,
        name: impl Into<String>,
        context: ContextMap,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            ref_id: None,
            stage_type: stage_type.into(),
            name: name.into(),
            execution_id: execution_id.into(),
            context,
            outputs: ContextMap::new(),
            tasks: Vec::new(),
            status: ExecutionStatus::NotStarted,
            parent_stage_id: None,
            synthetic_stage_owner: None,
            requisite_stage_ref_ids: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Sets the ref id.
    #[must_use]
    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    /// Sets the requisite stage ref ids.
    #[must_use]
    pub fn with_requisites<I, S>(mut self, ref_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requisite_stage_ref_ids = ref_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Links the stage under a parent as a synthetic stage.
    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>, owner: SyntheticStageOwner) -> Self {
        self.parent_stage_id = Some(parent_id.into());
        self.synthetic_stage_owner = Some(owner);
        self
    }

    /// Returns true if the stage was injected by a parent.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.parent_stage_id.is_some()
    }

    /// Checks that parent id and owner are either both set or both unset.
    pub fn validate_synthetic_linkage(&self) -> Result<(), GraphValidationError> {
        match (&self.parent_stage_id, &self.synthetic_stage_owner) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            (Some(_), None) => Err(GraphValidationError::new(format!(
                "Stage {} has a parent but no synthetic stage owner",
                self.id
            ))
            .with_stages(vec![self.id.clone()])
            .with_code("GRAPH-SYNTHETIC-LINKAGE")),
            (None, Some(_)) => Err(GraphValidationError::new(format!(
                "Stage {} has a synthetic stage owner but no parent",
                self.id
            ))
            .with_stages(vec![self.id.clone()])
            .with_code("GRAPH-SYNTHETIC-LINKAGE")),
        }
    }

    /// Reads a boolean context entry; `"true"`/`"false"` strings are accepted.
    #[must_use]
    pub fn context_bool(&self, key: &str) -> Option<bool> {
        match self.context.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Reads a string context entry.
    #[must_use]
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// Reads a non-negative integer context entry. Floats are truncated and
    /// numeric strings parsed.
    #[must_use]
    pub fn context_u64(&self, key: &str) -> Option<u64> {
        match self.context.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// The stage timeout from `stageTimeoutMs`, if configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.context_u64(keys::STAGE_TIMEOUT_MS)
            .map(Duration::from_millis)
    }

    /// The backoff override from `backoffPeriodMs`, if configured.
    #[must_use]
    pub fn backoff_period(&self) -> Option<Duration> {
        self.context_u64(keys::BACKOFF_PERIOD_MS)
            .map(Duration::from_millis)
    }

    /// True if failures should be recorded as FAILED_CONTINUE.
    #[must_use]
    pub fn continue_pipeline_on_failure(&self) -> bool {
        self.context_bool(keys::CONTINUE_PIPELINE).unwrap_or(false)
    }

    /// True unless `failPipeline` is explicitly false.
    #[must_use]
    pub fn should_fail_pipeline(&self) -> bool {
        self.context_bool(keys::FAIL_PIPELINE).unwrap_or(true)
    }

    /// True if synthetic siblings may keep running after this stage fails.
    #[must_use]
    pub fn allow_sibling_stages_to_continue_on_failure(&self) -> bool {
        self.is_synthetic()
            && self
                .context_bool(keys::ALLOW_SIBLINGS_ON_FAILURE)
                .unwrap_or(false)
    }

    /// True if the stage was skipped by a user.
    #[must_use]
    pub fn is_manually_skipped(&self) -> bool {
        self.context_bool(keys::MANUAL_SKIP).unwrap_or(false)
    }

    /// Maps a failure onto the status the stage should end with.
    #[must_use]
    pub fn failure_status(&self, default: ExecutionStatus) -> ExecutionStatus {
        if self.continue_pipeline_on_failure() {
            ExecutionStatus::FailedContinue
        } else if self.should_fail_pipeline() {
            default
        } else {
            ExecutionStatus::Stopped
        }
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn task_by_id(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Looks up a task by id for mutation.
    pub fn task_by_id_mut(&mut self, task_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Marks the stage as running.
    pub fn start(&mut self, now: EpochMillis) {
        self.status = ExecutionStatus::Running;
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    /// Marks the stage as complete.
    pub fn complete(&mut self, status: ExecutionStatus, now: EpochMillis) {
        self.status = status;
        self.end_time = Some(now);
    }
}
