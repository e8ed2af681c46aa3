//! Pipeline building and execution.
//!
//! This module provides:
//! - Typestate builders assembling an immutable stage chain
//! - The worker pool running task loops
//! - The running [`Pipeline`] with its push entry point and lifecycle

mod builder;
mod chain;
mod pool;
mod runtime;

pub use builder::{
    builder, FilterBuilder, PostBuilder, ProcessBuilder, SinkBuilder, SourceBuilder, SourceMode,
};
pub use runtime::{ExceptionHandler, Pipeline};
