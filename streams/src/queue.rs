//! Per-task queues.
//!
//! Every task owns one queue when a pipeline runs in queued push mode. Queues
//! are multi-producer (any thread may push) and single-consumer in practice
//! (only the owning task loop polls), but every implementation is safe for
//! concurrent consumers as well.

use crate::errors::{ConfigResult, ConfigurationError};
use crossbeam::queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

/// A concurrent FIFO queue backing one task.
pub trait TaskQueue<T>: Send + Sync {
    /// Offers an item to the back of the queue.
    ///
    /// Returns the item back if the queue is at capacity.
    fn offer(&self, item: T) -> Result<(), T>;

    /// Removes the item at the front of the queue, if any.
    fn poll(&self) -> Option<T>;

    /// Returns the number of pending items.
    fn len(&self) -> usize;

    /// Returns true if no items are pending.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity, or `None` if unbounded.
    fn capacity(&self) -> Option<usize>;
}

/// Selects the queue implementation used for every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueKind {
    /// Lock-free, unbounded multi-producer/multi-consumer queue.
    #[default]
    Unbounded,
    /// Lock-free ring buffer with a fixed capacity.
    Bounded {
        /// Number of slots.
        capacity: usize,
    },
    /// Mutex-guarded deque, optionally bounded.
    Locked {
        /// Number of slots, `None` for unbounded.
        capacity: Option<usize>,
    },
}

impl QueueKind {
    /// Validates the queue kind.
    ///
    /// # Errors
    ///
    /// Returns an error if a bounded kind has zero capacity.
    pub fn validate(&self) -> ConfigResult<()> {
        match *self {
            Self::Bounded { capacity } | Self::Locked { capacity: Some(capacity) } if capacity == 0 => {
                Err(ConfigurationError::positive("queue.capacity", capacity))
            }
            _ => Ok(()),
        }
    }

    /// Creates an empty queue of this kind.
    #[must_use]
    pub fn create<T: Send + 'static>(&self) -> Box<dyn TaskQueue<T>> {
        match *self {
            Self::Unbounded => Box::new(UnboundedQueue::new()),
            Self::Bounded { capacity } => Box::new(BoundedQueue::new(capacity)),
            Self::Locked { capacity } => Box::new(LockedQueue::new(capacity)),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => write!(f, "unbounded"),
            Self::Bounded { capacity } => write!(f, "bounded({capacity})"),
            Self::Locked { capacity: Some(capacity) } => write!(f, "locked({capacity})"),
            Self::Locked { capacity: None } => write!(f, "locked"),
        }
    }
}

/// Unbounded lock-free queue using crossbeam's `SegQueue`.
#[derive(Debug)]
pub struct UnboundedQueue<T> {
    queue: SegQueue<T>,
}

impl<T> UnboundedQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }
}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> TaskQueue<T> for UnboundedQueue<T> {
    fn offer(&self, item: T) -> Result<(), T> {
        self.queue.push(item);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Bounded lock-free queue using crossbeam's `ArrayQueue`.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    queue: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; validate with [`QueueKind::validate`] first.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }
}

impl<T: Send> TaskQueue<T> for BoundedQueue<T> {
    fn offer(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.queue.capacity())
    }
}

/// Deque guarded by a `parking_lot` mutex.
#[derive(Debug)]
pub struct LockedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: Option<usize>,
}

impl<T> LockedQueue<T> {
    /// Creates an empty queue, bounded if `capacity` is set.
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

impl<T: Send> TaskQueue<T> for LockedQueue<T> {
    fn offer(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if self.capacity.is_some_and(|capacity| items.len() >= capacity) {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
