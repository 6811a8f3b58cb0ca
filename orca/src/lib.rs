//! # Orca
//!
//! A stage-graph execution engine for long-running delivery pipelines.
//!
//! An execution is a graph of stages linked by requisite ref ids. Each stage
//! type is planned by a [`StageDefinitionBuilder`](graph::StageDefinitionBuilder)
//! that declares its tasks and the synthetic stages injected before or after
//! it. Tasks are invoked repeatedly: a RUNNING result reschedules the task
//! after a backoff until it finishes, times out, or the execution is canceled.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orca::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run(services: StageServices) -> Result<(), OrcaError> {
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let stages = Arc::new(default_stage_resolver(&services)?);
//! let tasks = Arc::new(default_task_resolver(&services, clock.clone()));
//! let planner = StagePlanner::new(
//!     stages,
//!     ContextParameterProcessor::new(Arc::new(PlaceholderEvaluator::new())),
//! );
//! let runner = ExecutionRunner::new(
//!     Arc::new(InMemoryExecutionRepository::new()),
//!     planner,
//!     TaskRunner::new(tasks, clock.clone(), TaskRunnerConfig::default()),
//!     clock,
//!     Arc::new(LoggingEventSink::debug()),
//! );
//!
//! let wait = StageExecution::new("", "wait", "Wait", ContextMap::new())
//!     .with_ref_id("1")
//!     .with_context_entry("waitTime", 30);
//! let execution = PipelineExecution::new(ExecutionType::Pipeline, "app").with_stage(wait);
//! let finished = runner.start(execution).await?;
//! assert!(finished.status.is_complete());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod expressions;
pub mod graph;
pub mod model;
pub mod observability;
pub mod repository;
pub mod runner;
pub mod services;
pub mod stages;
pub mod tasks;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, TaskRunnerConfig, TracingConfig};
    pub use crate::core::{ContextMap, ExecutionStatus, ExecutionType, SyntheticStageOwner, TaskResult};
    pub use crate::errors::{GraphValidationError, OrcaError, RepositoryError, ServiceError, TaskError};
    pub use crate::events::{EventSink, ExecutionEvent, LoggingEventSink, NoOpEventSink};
    pub use crate::expressions::{ContextParameterProcessor, ExpressionEvaluator, PlaceholderEvaluator};
    pub use crate::graph::{StageDefinitionBuilder, StageGraphBuilder, StagePlanner, StageResolver, TaskGraphBuilder};
    pub use crate::model::{PipelineExecution, StageExecution, TaskExecution};
    pub use crate::observability::init_tracing;
    pub use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
    pub use crate::runner::{Clock, ExecutionRunner, SystemClock, TaskRunner};
    pub use crate::stages::{default_stage_resolver, default_task_resolver, StageServices};
    pub use crate::tasks::{RetrySchedule, Task, TaskResolver};
}
