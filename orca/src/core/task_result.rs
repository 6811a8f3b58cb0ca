//! The value a task attempt returns to the runner.

use super::{ContextMap, ExecutionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result of one task attempt.
///
/// `context` is merged into the stage's own context and `outputs` into the
/// stage outputs that downstream stages see through their merged context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The status reported by the task.
    pub status: ExecutionStatus,

    /// Values merged into the stage context.
    #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
    pub context: ContextMap,

    /// Values merged into the stage outputs.
    #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
    pub outputs: ContextMap,
}

impl TaskResult {
    /// Creates a result with the given status and no data.
    #[must_use]
    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            context: ContextMap::new(),
            outputs: ContextMap::new(),
        }
    }

    /// Creates a SUCCEEDED result.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::with_status(ExecutionStatus::Succeeded)
    }

    /// Creates a RUNNING result; the runner re-invokes the task after a backoff.
    #[must_use]
    pub fn running() -> Self {
        Self::with_status(ExecutionStatus::Running)
    }

    /// Creates a TERMINAL result.
    #[must_use]
    pub fn terminal() -> Self {
        Self::with_status(ExecutionStatus::Terminal)
    }

    /// Replaces the context updates.
    #[must_use]
    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    /// Adds one context update.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Replaces the output updates.
    #[must_use]
    pub fn with_outputs(mut self, outputs: ContextMap) -> Self {
        self.outputs = outputs;
        self
    }

    /// Adds one output update.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    /// Overlays another result's data onto this one, keeping this status.
    #[must_use]
    pub fn merge(mut self, other: Option<Self>) -> Self {
        if let Some(other) = other {
            self.context.extend(other.context);
            self.outputs.extend(other.outputs);
        }
        self
    }
}

impl Default for TaskResult {
    fn default() -> Self {
        Self::succeeded()
    }
}
