//! Testing utilities for orca executions.
//!
//! This module provides:
//! - Scripted tasks and stage definitions
//! - A runner fixture with a manual clock and in-memory storage
//! - Assertions over execution state

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_stage_exception, assert_stage_order, assert_stage_status, assert_synthetic_child};
pub use fixtures::{pipeline, stage, TestFixture, FIXTURE_START_MILLIS};
pub use mocks::{MockStageDefinition, MockTask, ScriptedStep};
