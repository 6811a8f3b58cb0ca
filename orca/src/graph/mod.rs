//! Stage graph construction.
//!
//! Stage definitions contribute tasks through a [`TaskGraphBuilder`] and
//! synthetic stages through a [`StageGraphBuilder`]. The [`StagePlanner`]
//! drives both for one stage at a time, using the [`StageResolver`] to find
//! the definition for a stage type.

mod definition;
mod planner;
mod resolver;
mod stage_graph;
mod task_graph;

pub use definition::StageDefinitionBuilder;
pub use planner::{StagePlan, StagePlanner};
pub use resolver::StageResolver;
pub use stage_graph::StageGraphBuilder;
pub use task_graph::{TaskGraphBuilder, TaskNode};
