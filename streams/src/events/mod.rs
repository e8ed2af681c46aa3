//! Event sink system for observability.
//!
//! Pipelines report lifecycle changes and swallowed failures through an
//! [`EventSink`] injected at build time. The default sink forwards to
//! `tracing`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A task loop pool was launched.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// All task loops exited and the pool was shut down.
pub const PIPELINE_STOPPED: &str = "pipeline.stopped";
/// Task loops were still running when the shutdown grace period elapsed.
pub const PIPELINE_SHUTDOWN_TIMED_OUT: &str = "pipeline.shutdown_timed_out";
/// An item failed and no exception handler was registered.
pub const ITEM_FAILED: &str = "item.failed";
/// A push was refused (queue full, bad partition, wrong mode, stopped).
pub const PUSH_REJECTED: &str = "push.rejected";
/// The registered exception handler panicked.
pub const HANDLER_PANICKED: &str = "handler.panicked";

/// Returns true for event types that report a failure.
#[must_use]
pub fn is_failure(event_type: &str) -> bool {
    matches!(
        event_type,
        PIPELINE_SHUTDOWN_TIMED_OUT | ITEM_FAILED | PUSH_REJECTED | HANDLER_PANICKED
    )
}
