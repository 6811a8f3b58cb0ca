//! Ordered list of tasks a stage runs.

use crate::model::TaskExecution;

/// A task declared by a stage definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    /// Display name.
    pub name: String,
    /// Key used to resolve the implementation.
    pub implementing_type: String,
}

impl TaskNode {
    /// Creates a new task node.
    #[must_use]
    pub fn new(name: impl Into<String>, implementing_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementing_type: implementing_type.into(),
        }
    }
}

/// Collects the tasks of a stage in execution order.
#[derive(Debug, Clone, Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<TaskNode>,
}

impl TaskGraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task whose display name matches its type.
    pub fn with_task(&mut self, name: impl Into<String>, implementing_type: impl Into<String>) -> &mut Self {
        self.nodes.push(TaskNode::new(name, implementing_type));
        self
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no tasks were declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Materializes task records with sequential ids and start/end markers.
    #[must_use]
    pub fn build(self) -> Vec<TaskExecution> {
        let count = self.nodes.len();
        self.nodes
            .into_iter()
            .enumerate()
            .map(|(index, node)| {
                let mut task = TaskExecution::new((index + 1).to_string(), node.name, node.implementing_type);
                task.stage_start = index == 0;
                task.stage_end = index + 1 == count;
                task
            })
            .collect()
    }
}
