//! Error types for replicator streams.
//!
//! Three failure families exist:
//!
//! - [`ConfigurationError`]: raised synchronously by builder calls and by
//!   `build()`. Fatal to configuration, never retried.
//! - [`ProcessingError`]: anything raised by user supplied code while an item
//!   flows through a pipeline. Caught per item and handed to the registered
//!   exception handler.
//! - [`ShutdownError`]: the worker pool did not terminate within the grace
//!   period given to `stop()`. Returned to the caller of `stop()`.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for streams operations.
#[derive(Debug, Error)]
pub enum StreamsError {
    /// The pipeline configuration is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// User code failed while processing an item.
    #[error("{0}")]
    Processing(#[from] ProcessingError),

    /// The worker pool failed to shut down in time.
    #[error("{0}")]
    Shutdown(#[from] ShutdownError),

    /// The worker pool could not be created.
    #[error("failed to create worker pool: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when a pipeline is configured incorrectly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid pipeline configuration: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The configuration field at fault, if known.
    pub field: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub(crate) fn positive(field: &str, value: usize) -> Self {
        Self::new(format!("'{field}' must be greater than zero, got {value}")).with_field(field)
    }
}

/// The stage in which a [`ProcessingError`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The pull supplier.
    Supply,
    /// The partitioner selecting a task for a pushed item.
    Partition,
    /// The filter predicate chain.
    Filter,
    /// The transform chain.
    Process,
    /// The sink chain.
    Sink,
    /// The post-hook chain.
    Post,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supply => write!(f, "supply"),
            Self::Partition => write!(f, "partition"),
            Self::Filter => write!(f, "filter"),
            Self::Process => write!(f, "process"),
            Self::Sink => write!(f, "sink"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Error raised by user code while an item was being processed.
///
/// The original error is kept as the `source`, so hosts can branch on their
/// own error types with [`ProcessingError::downcast_ref`].
#[derive(Debug, Error)]
#[error("{stage} stage failed on task {task}: {source}")]
pub struct ProcessingError {
    /// The stage that failed.
    pub stage: Stage,
    /// Index of the task that was processing the item.
    pub task: usize,
    /// The underlying error.
    #[source]
    pub source: anyhow::Error,
}

impl ProcessingError {
    /// Creates a new processing error.
    #[must_use]
    pub fn new(stage: Stage, task: usize, source: anyhow::Error) -> Self {
        Self {
            stage,
            task,
            source,
        }
    }

    /// Builds a processing error from a caught panic payload.
    pub(crate) fn from_panic(stage: Stage, task: usize, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());

        Self::new(stage, task, anyhow::Error::new(PanickedError { message }))
    }

    /// Attempts to view the underlying error as a concrete type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.source.downcast_ref::<E>()
    }

    /// Returns true if the underlying error was a panic in user code.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.source.is::<PanickedError>()
    }
}

/// The error recorded when user code panics instead of returning an error.
#[derive(Debug, Clone, Error)]
#[error("panicked: {message}")]
pub struct PanickedError {
    /// The panic message.
    pub message: String,
}

/// Error raised when worker loops do not exit within the shutdown grace period.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{pending_loops} task loop(s) still running after {grace:?} shutdown grace period")]
pub struct ShutdownError {
    /// Task loops that had not exited when the grace period elapsed.
    pub pending_loops: usize,
    /// The grace period that was granted.
    pub grace: Duration,
}

/// Result alias used by builder calls.
pub type ConfigResult<T> = Result<T, ConfigurationError>;
