//! Task execution records.

use crate::core::{EpochMillis, ExecutionStatus};
use serde::{Deserialize, Serialize};

/// One task slot inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    /// Sequential id within the stage ("1", "2", ...).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Key used to resolve the task implementation.
    pub implementing_type: String,
    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<EpochMillis>,
    /// When the task completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<EpochMillis>,
    /// True for the first task of the stage.
    #[serde(default)]
    pub stage_start: bool,
    /// True for the last task of the stage.
    #[serde(default)]
    pub stage_end: bool,
}

impl TaskExecution {
    /// Creates a new task record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        implementing_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            implementing_type: implementing_type.into(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            stage_start: false,
            stage_end: false,
        }
    }

    /// Marks the task as running.
    pub fn start(&mut self, now: EpochMillis) {
        self.status = ExecutionStatus::Running;
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    /// Marks the task as complete with the given status.
    pub fn complete(&mut self, status: ExecutionStatus, now: EpochMillis) {
        self.status = status;
        self.end_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_keeps_first_start_time() {
        let mut task = TaskExecution::new("1", "wait", "wait");
        task.start(100);
        task.start(200);
        assert_eq!(task.start_time, Some(100));
        assert_eq!(task.status, ExecutionStatus::Running);

        task.complete(ExecutionStatus::Succeeded, 300);
        assert_eq!(task.end_time, Some(300));
    }

    #[test]
    fn test_serialize_camel_case() {
        let task = TaskExecution::new("1", "runJob", "runJob");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["implementingType"], "runJob");
        assert_eq!(json["status"], "NOT_STARTED");
        assert!(json.get("startTime").is_none());
    }
}
