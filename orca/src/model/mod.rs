//! Execution model: pipelines, stages and tasks.
//!
//! A [`PipelineExecution`] owns a flat, ordered list of [`StageExecution`]s.
//! Top-level stages are linked by ref ids; synthetic stages point at their
//! parent. Navigation helpers live on the execution so stages stay plain data.

mod execution;
mod stage;
mod task;

pub use execution::{PausedDetails, PipelineExecution};
pub use stage::{context_keys, StageExecution};
pub use task::TaskExecution;
