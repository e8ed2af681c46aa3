//! Event sink trait and implementations.

use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, info, warn, Level};

use super::is_failure;

/// Receives the lifecycle and failure events of a pipeline.
///
/// A sink is handed to each pipeline through its builder; nothing is looked up
/// from process-wide state. Implementations must never panic or block for long,
/// since they are called from task loops.
pub trait EventSink: Send + Sync + Debug {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "pipeline.started")
    /// * `data` - Optional event data; pipelines always include a `pipeline` name
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing`, tagged with the emitting pipeline.
///
/// Failure events (`item.failed`, `handler.panicked`, ...) go out at WARN;
/// lifecycle events use the configured level.
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
    /// Creates a sink logging lifecycle events at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        let pipeline = data
            .as_ref()
            .and_then(|fields| fields.get("pipeline"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if is_failure(event_type) {
            warn!(pipeline, event_type, event_data = ?data, "pipeline failure");
        } else if self.level >= Level::DEBUG {
            debug!(pipeline, event_type, event_data = ?data, "pipeline event");
        } else {
            info!(pipeline, event_type, event_data = ?data, "pipeline event");
        }
    }
}

/// Keeps every event in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns how many events of exactly this type were collected.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events.read().iter().filter(|(t, _)| t == event_type).count()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
