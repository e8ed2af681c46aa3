//! # Replicator Streams
//!
//! Partitioned, concurrent multi-stage processing pipelines for a
//! change-data-capture replicator.
//!
//! A pipeline moves items from a source through:
//!
//! - **Filters**: predicates combined with short-circuit AND
//! - **Transforms**: a chain of functions, any of which may drop an item
//! - **Sinks**: terminal consumers; later sinks run only after earlier ones succeed
//! - **Post hooks**: bookkeeping over the original input, e.g. checkpointing
//!
//! Items are either pulled by task loops from a supplier or pushed in by the
//! host. Pushed items are routed to per-task queues by a partitioner, and each
//! task processes its items strictly in order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use replicator_streams::prelude::*;
//!
//! # fn main() -> Result<(), StreamsError> {
//! let pipeline = builder::<String>()
//!     .tasks(4)?
//!     .queue(QueueKind::Unbounded)?
//!     .partitioner(partition::hash_by(|table: &String| table.clone()))
//!     .from_push()
//!     .filter(|table| Ok(!table.is_empty()))
//!     .map(|table| table.to_uppercase())
//!     .to(|table| {
//!         println!("applied {table}");
//!         Ok(true)
//!     })
//!     .build()?;
//!
//! pipeline.start()?;
//! pipeline.push("orders".to_string());
//! pipeline.stop()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod errors;
pub mod events;
pub mod partition;
pub mod pipeline;
pub mod queue;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{PipelineConfig, QueueConfig, QueueType};
    pub use crate::errors::{
        ConfigurationError, ProcessingError, ShutdownError, Stage, StreamsError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::partition::{self, Partitioner};
    pub use crate::pipeline::{builder, Pipeline, SourceMode};
    pub use crate::queue::{QueueKind, TaskQueue};
}
