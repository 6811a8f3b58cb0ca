//! Event sink trait and implementations.

use super::ExecutionEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives lifecycle events from the runner.
///
/// Sinks are passed to the runner explicitly; there is no process-wide sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &ExecutionEvent);

    /// Emits an event without waiting. Must never panic.
    fn try_emit(&self, event: &ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &ExecutionEvent) {}

    fn try_emit(&self, _event: &ExecutionEvent) {}
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &ExecutionEvent) {
        let status = event.status().map(|s| s.to_string());
        if self.level == Level::DEBUG {
            debug!(
                event_type = event.event_type(),
                execution_id = event.execution_id(),
                status = ?status,
                event = ?event,
                "Event: {}", event.event_type()
            );
        } else {
            info!(
                event_type = event.event_type(),
                execution_id = event.execution_id(),
                status = ?status,
                "Event: {}", event.event_type()
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &ExecutionEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &ExecutionEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<ExecutionEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.read().clone()
    }

    /// Event names in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(ExecutionEvent::event_type).collect()
    }

    /// Events whose name starts with a prefix such as `stage.`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<ExecutionEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &ExecutionEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &ExecutionEvent) {
        self.events.write().push(event.clone());
    }
}
