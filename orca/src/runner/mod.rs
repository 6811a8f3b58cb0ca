//! Drives executions forward.
//!
//! [`TaskRunner`] performs one attempt of one task. [`ExecutionRunner`]
//! schedules stages, loops tasks through the task runner and persists every
//! change. Both take their notion of time from a [`Clock`].

mod clock;
mod execution_runner;
mod task_runner;

pub use clock::{to_millis, Clock, ManualClock, SystemClock};
pub use execution_runner::ExecutionRunner;
pub use task_runner::{format_duration_words, RunOutcome, TaskAttempt, TaskRunner, RESTRICT_EXECUTION_WINDOW_TYPE};
