//! Lifecycle events emitted by the runner.

use crate::core::ExecutionStatus;
use serde::{Deserialize, Serialize};

/// A lifecycle transition of an execution, stage or task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The execution started running.
    ExecutionStarted {
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
    },
    /// The execution reached a final status.
    ExecutionCompleted {
        /// Execution id.
        execution_id: String,
        /// Final status.
        status: ExecutionStatus,
    },
    /// A stage started running.
    StageStarted {
        /// Execution id.
        execution_id: String,
        /// Stage id.
        stage_id: String,
        /// Stage type.
        stage_type: String,
    },
    /// A stage reached a final status.
    StageCompleted {
        /// Execution id.
        execution_id: String,
        /// Stage id.
        stage_id: String,
        /// Stage type.
        stage_type: String,
        /// Final status.
        status: ExecutionStatus,
    },
    /// A task started its first attempt.
    TaskStarted {
        /// Execution id.
        execution_id: String,
        /// Stage id.
        stage_id: String,
        /// Task id within the stage.
        task_id: String,
        /// Task type.
        task_type: String,
    },
    /// A task reached a final status.
    TaskCompleted {
        /// Execution id.
        execution_id: String,
        /// Stage id.
        stage_id: String,
        /// Task id within the stage.
        task_id: String,
        /// Task type.
        task_type: String,
        /// Final status.
        status: ExecutionStatus,
    },
}

impl ExecutionEvent {
    /// Dotted event name, e.g. `stage.completed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution.started",
            Self::ExecutionCompleted { .. } => "execution.completed",
            Self::StageStarted { .. } => "stage.started",
            Self::StageCompleted { .. } => "stage.completed",
            Self::TaskStarted { .. } => "task.started",
            Self::TaskCompleted { .. } => "task.completed",
        }
    }

    /// Id of the execution the event belongs to.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::StageStarted { execution_id, .. }
            | Self::StageCompleted { execution_id, .. }
            | Self::TaskStarted { execution_id, .. }
            | Self::TaskCompleted { execution_id, .. } => execution_id,
        }
    }

    /// Final status carried by completion events.
    #[must_use]
    pub fn status(&self) -> Option<ExecutionStatus> {
        match self {
            Self::ExecutionCompleted { status, .. }
            | Self::StageCompleted { status, .. }
            | Self::TaskCompleted { status, .. } => Some(*status),
            _ => None,
        }
    }
}
