//! Lifecycle events for observability.
//!
//! The runner reports execution, stage and task transitions to an
//! [`EventSink`] it was constructed with.

mod event;
mod sink;

pub use event::ExecutionEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
