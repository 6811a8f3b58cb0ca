//! Core domain types for orca.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Execution status, execution type and synthetic stage owner enums
//! - The task result returned by every task attempt
//! - The JSON map type used for stage contexts and outputs

mod status;
mod task_result;

pub use status::{ExecutionStatus, ExecutionType, SyntheticStageOwner};
pub use task_result::TaskResult;

/// A stage context or output map.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;
