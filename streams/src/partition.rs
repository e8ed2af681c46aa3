//! Partitioners route pushed items to task indices.
//!
//! Items that map to the same task are processed strictly in push order, so
//! the partitioner defines the ordering scope of a pipeline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Maps an item and the total task count to a task index in `0..tasks`.
///
/// May be called concurrently from several threads, so it must be free of
/// unsynchronized side effects.
pub type Partitioner<I> = Arc<dyn Fn(&I, usize) -> usize + Send + Sync>;

/// Routes every item to task 0.
#[must_use]
pub fn single<I>() -> impl Fn(&I, usize) -> usize + Send + Sync + Copy {
    |_, _| 0
}

/// Routes items by the hash of a key extracted from each item.
///
/// Items with equal keys always land on the same task.
pub fn hash_by<I, K, F>(key: F) -> impl Fn(&I, usize) -> usize + Send + Sync
where
    K: Hash,
    F: Fn(&I) -> K + Send + Sync,
{
    move |item, tasks| {
        let mut hasher = DefaultHasher::new();
        key(item).hash(&mut hasher);
        bucket(hasher.finish(), tasks)
    }
}

/// Routes integer-like items by their value modulo the task count.
pub fn modulo<I, F>(value: F) -> impl Fn(&I, usize) -> usize + Send + Sync
where
    F: Fn(&I) -> u64 + Send + Sync,
{
    move |item, tasks| bucket(value(item), tasks)
}

#[allow(clippy::cast_possible_truncation)]
fn bucket(hash: u64, tasks: usize) -> usize {
    (hash % tasks.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        let partitioner = single::<String>();
        assert_eq!(partitioner(&"a".to_string(), 8), 0);
    }

    #[test]
    fn test_hash_by_is_deterministic_and_in_range() {
        let partitioner = hash_by(|s: &String| s.clone());
        for key in ["users", "orders", "items", "payments"] {
            let first = partitioner(&key.to_string(), 5);
            assert!(first < 5);
            assert_eq!(first, partitioner(&key.to_string(), 5));
        }
    }

    #[test]
    fn test_hash_by_groups_equal_keys() {
        let partitioner = hash_by(|pair: &(&str, u32)| pair.0);
        assert_eq!(partitioner(&("users", 1), 16), partitioner(&("users", 99), 16));
    }

    #[test]
    fn test_modulo() {
        let partitioner = modulo(|v: &i64| v.unsigned_abs());
        assert_eq!(partitioner(&7, 3), 1);
        assert_eq!(partitioner(&-7, 3), 1);
        assert_eq!(partitioner(&9, 3), 0);
    }
}
