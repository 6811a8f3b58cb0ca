//! Registry mapping task type keys to implementations.

use super::Task;
use crate::errors::GraphValidationError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves task types to implementations.
#[derive(Default)]
pub struct TaskResolver {
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
}

impl std::fmt::Debug for TaskResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.tasks.read().keys().cloned().collect();
        types.sort();
        f.debug_struct("TaskResolver").field("types", &types).finish()
    }
}

impl TaskResolver {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task, replacing any previous one with the same type.
    pub fn register(&self, task: Arc<dyn Task>) {
        self.tasks.write().insert(task.task_type().to_string(), task);
    }

    /// Looks up a task by type.
    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn Task>, GraphValidationError> {
        self.tasks
            .read()
            .get(task_type)
            .cloned()
            .ok_or_else(|| GraphValidationError::unknown_task_type(task_type))
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns true if no tasks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
