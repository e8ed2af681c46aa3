//! Serializable pipeline configuration.
//!
//! Mirrors the host replicator's `replicator.*` settings so a pipeline can be
//! configured from the same YAML/JSON document as the rest of the process.

use crate::errors::{ConfigResult, ConfigurationError};
use crate::queue::QueueKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a pipeline's worker pool and queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of execution threads (`replicator.threads`).
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Number of task partitions (`replicator.tasks`).
    #[serde(default = "default_tasks")]
    pub tasks: usize,
    /// Queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// How long a push may wait for space in a bounded queue
    /// (`replicator.queue.timeout`).
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Grace period granted to task loops on stop.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Pause between pull attempts when the supplier has nothing to offer.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

fn default_threads() -> usize {
    1
}

fn default_tasks() -> usize {
    1
}

fn default_push_timeout_ms() -> u64 {
    300 * 1000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_idle_wait_ms() -> u64 {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            tasks: default_tasks(),
            queue: QueueConfig::default(),
            push_timeout_ms: default_push_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the thread count.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the task count.
    #[must_use]
    pub fn with_tasks(mut self, tasks: usize) -> Self {
        self.tasks = tasks;
        self
    }

    /// Sets the queue configuration.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Push timeout as a `Duration`.
    #[must_use]
    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Idle wait as a `Duration`.
    #[must_use]
    pub const fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a count is zero or the queue settings are invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.threads == 0 {
            return Err(ConfigurationError::positive("threads", self.threads));
        }
        if self.tasks == 0 {
            return Err(ConfigurationError::positive("tasks", self.tasks));
        }
        self.queue.kind()?;
        Ok(())
    }
}

/// Which queue implementation backs each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// No queue: `push()` runs the stage chain on the caller's thread.
    None,
    /// Lock-free unbounded queue.
    #[default]
    Unbounded,
    /// Lock-free bounded queue of `capacity` slots.
    Bounded,
    /// Mutex-guarded deque bounded to `capacity` slots.
    Locked,
}

/// Queue settings (`replicator.queue.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue implementation.
    #[serde(default, rename = "type")]
    pub queue_type: QueueType,
    /// Capacity for bounded queue types (`replicator.queue.size`).
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_type: QueueType::default(),
            capacity: default_queue_capacity(),
        }
    }
}

impl QueueConfig {
    /// Resolves the settings into a [`QueueKind`], `None` meaning synchronous push.
    ///
    /// # Errors
    ///
    /// Returns an error if a bounded type is configured with zero capacity.
    pub fn kind(&self) -> ConfigResult<Option<QueueKind>> {
        let kind = match self.queue_type {
            QueueType::None => return Ok(None),
            QueueType::Unbounded => QueueKind::Unbounded,
            QueueType::Bounded => QueueKind::Bounded {
                capacity: self.capacity,
            },
            QueueType::Locked => QueueKind::Locked {
                capacity: Some(self.capacity),
            },
        };
        kind.validate()?;
        Ok(Some(kind))
    }
}
