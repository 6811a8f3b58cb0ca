//! Error types for the orca engine.
//!
//! Graph construction problems surface as [`GraphValidationError`] and abort
//! planning before any stage runs. Failures inside a task surface as
//! [`TaskError`] and are turned into stage statuses by the task runner.
//! Cancellation and timeouts are statuses, never errors.

use crate::core::ExecutionType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum OrcaError {
    /// The stage graph could not be constructed.
    #[error("{0}")]
    Validation(#[from] GraphValidationError),

    /// A task failed in a way the runner could not convert into a status.
    #[error("{0}")]
    Task(#[from] TaskError),

    /// The execution repository failed.
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// An external service call failed.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Expression evaluation failed outside of a summary-tracked walk.
    #[error("{0}")]
    Expression(#[from] ExpressionError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error raised while building or validating a stage graph.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// Ids or types of the stages involved.
    #[serde(default)]
    pub stages: Vec<String>,
    /// Stable error code (e.g. "GRAPH-MISSING-CONTEXT").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl GraphValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            code: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// A required context key was missing from a stage.
    #[must_use]
    pub fn missing_context(stage_type: &str, key: &str) -> Self {
        Self::new(format!(
            "Stage '{stage_type}' requires context key '{key}'"
        ))
        .with_stages(vec![stage_type.to_string()])
        .with_code("GRAPH-MISSING-CONTEXT")
    }

    /// No stage definition is registered for a type.
    #[must_use]
    pub fn unknown_stage_type(stage_type: &str) -> Self {
        Self::new(format!("No stage definition registered for type '{stage_type}'"))
            .with_stages(vec![stage_type.to_string()])
            .with_code("GRAPH-UNKNOWN-TYPE")
    }

    /// No task implementation is registered for a type.
    #[must_use]
    pub fn unknown_task_type(task_type: &str) -> Self {
        Self::new(format!("No task registered for type '{task_type}'"))
            .with_code("GRAPH-UNKNOWN-TASK")
    }

    /// A stage id could not be found in the execution.
    #[must_use]
    pub fn unknown_stage(stage_id: &str) -> Self {
        Self::new(format!("Stage '{stage_id}' does not exist in this execution"))
            .with_stages(vec![stage_id.to_string()])
            .with_code("GRAPH-UNKNOWN-STAGE")
    }

    /// Converts to a JSON representation stored on failed stages.
    #[must_use]
    pub fn to_details(&self) -> serde_json::Value {
        serde_json::json!({
            "exceptionType": "GraphValidationError",
            "details": {
                "error": self.message,
                "code": self.code,
                "stages": self.stages,
            },
            "shouldRetry": false,
        })
    }
}

/// Errors produced by a task's `execute`.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The user supplied bad input; logged at warn level.
    #[error("User error: {0}")]
    User(String),

    /// A remote call failed.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Whether a later attempt could succeed.
        retryable: bool,
    },

    /// The stage context is missing something the task needs.
    #[error("Invalid stage context: {0}")]
    InvalidContext(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Creates a retryable transport error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Returns true if the runner should reschedule the task.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    /// Returns true if the failure was caused by user input.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::User(_) | Self::InvalidContext(_))
    }

    /// Short name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "UserError",
            Self::Transport { .. } => "TransportError",
            Self::InvalidContext(_) => "InvalidContext",
            Self::Other(_) => "TaskError",
        }
    }

    /// Exception details recorded into a failed stage's context.
    #[must_use]
    pub fn to_details(&self, task_name: &str) -> serde_json::Value {
        serde_json::json!({
            "exceptionType": self.kind(),
            "operation": task_name,
            "details": { "error": self.to_string() },
            "shouldRetry": self.is_retryable(),
        })
    }
}

impl From<ServiceError> for TaskError {
    fn from(err: ServiceError) -> Self {
        let retryable = err.is_retryable();
        Self::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

/// Errors returned by external service clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The requested resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// What was looked up.
        resource: String,
    },

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response message.
        message: String,
    },

    /// The service could not be reached.
    #[error("Network error: {0}")]
    Network(String),
}

impl ServiceError {
    /// Creates a not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Returns true for throttling, server errors and network failures.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Network(_) => true,
        }
    }

    /// Returns true if the error means "no such thing".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Http { status: 404, .. })
    }
}

/// Errors raised by an execution repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// No execution with that id exists.
    #[error("No {execution_type} found for {id}")]
    NotFound {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        id: String,
    },

    /// A stage was written for an execution that is not stored.
    #[error("No execution found for stage {stage_id} (execution {execution_id})")]
    OrphanStage {
        /// Stage id.
        stage_id: String,
        /// Execution id the stage refers to.
        execution_id: String,
    },

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A failure evaluating one expression.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Failed to evaluate '{expression}': {reason}")]
pub struct ExpressionError {
    /// The expression text.
    pub expression: String,
    /// Why evaluation failed.
    pub reason: String,
}

impl ExpressionError {
    /// Creates a new expression error.
    #[must_use]
    pub fn new(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

/// Converts a set of string pairs into exception details.
#[must_use]
pub fn exception_details(
    exception_type: &str,
    message: &str,
    extra: HashMap<String, String>,
) -> serde_json::Value {
    let mut details = serde_json::Map::new();
    details.insert("error".to_string(), serde_json::json!(message));
    for (key, value) in extra {
        details.insert(key, serde_json::Value::String(value));
    }
    serde_json::json!({
        "exceptionType": exception_type,
        "details": details,
        "shouldRetry": false,
    })
}
