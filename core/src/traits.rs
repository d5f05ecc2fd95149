//! Core traits for the cogroup shuffle engine
//!
//! This module defines the bounds keys and values must satisfy to travel
//! through a shuffle, and the grouped record the engine hands to consumers.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// A value type that can be produced by a shard and grouped by the shuffle.
///
/// `Default` lets producers pre-allocate the batch buffers handed to
/// [`ShardSource::read`](crate::source::ShardSource::read).
pub trait ShuffleValue: Send + Sync + Clone + Debug + Default + 'static {}
impl<T> ShuffleValue for T where T: Send + Sync + Clone + Debug + Default + 'static {}

/// A key type that records can be partitioned and grouped by.
pub trait ShuffleKey: ShuffleValue + Hash + Eq {}
impl<T> ShuffleKey for T where T: ShuffleValue + Hash + Eq {}

/// All values contributed for one key, one per shard, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedRecord<K, V> {
    pub key: K,
    pub values: Vec<V>,
}

impl<K, V> GroupedRecord<K, V> {
    pub fn new(key: K, values: Vec<V>) -> Self {
        Self { key, values }
    }

    /// Number of contributions in the group.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_parts(self) -> (K, Vec<V>) {
        (self.key, self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouped_record_parts() {
        let record = GroupedRecord::new("3".to_string(), vec![3u64, 16777219]);
        assert_eq!(record.len(), 2);
        assert!(!record.is_empty());

        let (key, values) = record.into_parts();
        assert_eq!(key, "3");
        assert_eq!(values, vec![3, 16777219]);
    }
}
