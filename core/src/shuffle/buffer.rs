//! Per-partition grouping state.
//!
//! A [`GroupBuffer`] accumulates contributions for the keys routed to one
//! partition. A key's group is handed out as soon as every shard has
//! contributed exactly once, and is never reopened afterwards.

use crate::traits::{GroupedRecord, ShuffleKey, ShuffleValue};
use cogroup_common::{CogroupError, Result};
use std::collections::{HashMap, HashSet};

/// Number of incomplete keys named in an [`CogroupError::IncompleteGroups`].
const INCOMPLETE_SAMPLE: usize = 8;

/// A partial group: the values seen so far and which shards sent them.
#[derive(Debug)]
struct PendingGroup<V> {
    values: Vec<V>,
    shards: ShardSet,
}

/// Fixed-size bitmap over shard indexes.
#[derive(Debug, Clone)]
struct ShardSet {
    words: Vec<u64>,
}

impl ShardSet {
    fn new(num_shards: usize) -> Self {
        Self {
            words: vec![0; num_shards.div_ceil(64)],
        }
    }

    /// Returns false if the shard was already present.
    fn insert(&mut self, shard: usize) -> bool {
        let (word, bit) = (shard / 64, 1u64 << (shard % 64));
        let fresh = self.words[word] & bit == 0;
        self.words[word] |= bit;
        fresh
    }
}

/// Grouping buffer for a single partition.
///
/// Owned exclusively by one reducer, so it needs no synchronisation.
#[derive(Debug)]
pub struct GroupBuffer<K, V> {
    partition: u32,
    num_shards: usize,
    pending: HashMap<K, PendingGroup<V>>,
    completed: HashSet<K>,
    exhausted: Vec<bool>,
    remaining_shards: usize,
    records_seen: u64,
}

impl<K: ShuffleKey, V: ShuffleValue> GroupBuffer<K, V> {
    pub fn new(partition: u32, num_shards: usize) -> Self {
        Self {
            partition,
            num_shards,
            pending: HashMap::new(),
            completed: HashSet::new(),
            exhausted: vec![false; num_shards],
            remaining_shards: num_shards,
            records_seen: 0,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Number of keys still waiting for contributions.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of keys whose group has been handed out.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    /// Whether every shard has signalled exhaustion to this partition.
    pub fn all_exhausted(&self) -> bool {
        self.remaining_shards == 0
    }

    /// Shards that have not yet signalled exhaustion.
    pub fn live_shards(&self) -> Vec<usize> {
        self.exhausted
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(shard, _)| shard)
            .collect()
    }

    /// Add one shard's contribution for a key.
    ///
    /// Returns the completed group once the key has a value from every shard.
    pub fn accept(&mut self, shard: usize, key: K, value: V) -> Result<Option<GroupedRecord<K, V>>> {
        self.check_shard(shard)?;
        if self.exhausted[shard] {
            return Err(CogroupError::generation_error(
                shard,
                format!(
                    "emitted key {:?} to partition {} after signalling exhaustion",
                    key, self.partition
                ),
            ));
        }
        if self.completed.contains(&key) {
            return Err(CogroupError::GroupOverflow {
                key: format!("{key:?}"),
                expected: self.num_shards,
            });
        }
        self.records_seen += 1;

        let num_shards = self.num_shards;
        let group = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingGroup {
                values: Vec::with_capacity(num_shards),
                shards: ShardSet::new(num_shards),
            });
        if !group.shards.insert(shard) {
            return Err(CogroupError::DuplicateContribution {
                key: format!("{key:?}"),
                shard,
            });
        }
        group.values.push(value);

        if group.values.len() < self.num_shards {
            return Ok(None);
        }
        // Every shard is present exactly once, so the group cannot grow further.
        let (key, group) = self
            .pending
            .remove_entry(&key)
            .ok_or_else(|| CogroupError::internal_error("completed group vanished"))?;
        self.completed.insert(key.clone());
        Ok(Some(GroupedRecord::new(key, group.values)))
    }

    /// Record that a shard will send nothing more to this partition.
    ///
    /// Returns true once every shard has done so.
    pub fn mark_exhausted(&mut self, shard: usize) -> Result<bool> {
        self.check_shard(shard)?;
        if self.exhausted[shard] {
            return Err(CogroupError::generation_error(
                shard,
                format!(
                    "signalled exhaustion to partition {} twice",
                    self.partition
                ),
            ));
        }
        self.exhausted[shard] = true;
        self.remaining_shards -= 1;
        Ok(self.all_exhausted())
    }

    /// Check that nothing is left behind once all shards are exhausted.
    pub fn finish(&self) -> Result<()> {
        if !self.all_exhausted() {
            return Err(CogroupError::internal_error(format!(
                "partition {} finished while shards {:?} were still live",
                self.partition,
                self.live_shards()
            )));
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        let sample = self
            .pending
            .iter()
            .take(INCOMPLETE_SAMPLE)
            .map(|(key, group)| format!("{:?} ({}/{})", key, group.values.len(), self.num_shards))
            .collect();
        Err(CogroupError::IncompleteGroups {
            partition: self.partition,
            incomplete: self.pending.len(),
            expected: self.num_shards,
            sample,
        })
    }

    fn check_shard(&self, shard: usize) -> Result<()> {
        if shard >= self.num_shards {
            return Err(CogroupError::internal_error(format!(
                "shard {} out of range for {} shards",
                shard, self.num_shards
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: u32) -> String {
        k.to_string()
    }

    #[test]
    fn test_group_completes_after_every_shard() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 3);

        assert!(buffer.accept(2, key(7), 2 << 24 | 7).unwrap().is_none());
        assert!(buffer.accept(0, key(7), 7).unwrap().is_none());
        assert_eq!(buffer.pending_len(), 1);

        let group = buffer.accept(1, key(7), 1 << 24 | 7).unwrap().unwrap();
        assert_eq!(group.key, "7");
        assert_eq!(group.values, vec![2 << 24 | 7, 7, 1 << 24 | 7]);
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.completed_len(), 1);
        assert_eq!(buffer.records_seen(), 3);
    }

    #[test]
    fn test_single_shard_completes_immediately() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 1);
        let group = buffer.accept(0, key(1), 1).unwrap().unwrap();
        assert_eq!(group.values, vec![1]);
    }

    #[test]
    fn test_duplicate_contribution_is_rejected() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 2);
        buffer.accept(1, key(3), 1 << 24 | 3).unwrap();

        let err = buffer.accept(1, key(3), 1 << 24 | 3).unwrap_err();
        assert!(matches!(
            err,
            CogroupError::DuplicateContribution { shard: 1, .. }
        ));
    }

    #[test]
    fn test_contribution_after_completion_overflows() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 2);
        buffer.accept(0, key(3), 3).unwrap();
        buffer.accept(1, key(3), 1 << 24 | 3).unwrap().unwrap();

        let err = buffer.accept(0, key(3), 3).unwrap_err();
        assert!(matches!(err, CogroupError::GroupOverflow { expected: 2, .. }));
    }

    #[test]
    fn test_shard_bitmap_spans_words() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 130);
        for shard in 0..129 {
            assert!(buffer.accept(shard, key(0), shard as u64).unwrap().is_none());
        }
        let err = buffer.accept(64, key(0), 64).unwrap_err();
        assert!(matches!(
            err,
            CogroupError::DuplicateContribution { shard: 64, .. }
        ));
        let group = buffer.accept(129, key(0), 129).unwrap().unwrap();
        assert_eq!(group.len(), 130);
    }

    #[test]
    fn test_exhaustion_tracking() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(4, 2);
        assert_eq!(buffer.live_shards(), vec![0, 1]);
        assert!(!buffer.mark_exhausted(1).unwrap());
        assert_eq!(buffer.live_shards(), vec![0]);
        assert!(buffer.mark_exhausted(0).unwrap());
        assert!(buffer.all_exhausted());
        assert!(buffer.finish().is_ok());
    }

    #[test]
    fn test_double_exhaustion_is_a_generation_error() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 2);
        buffer.mark_exhausted(0).unwrap();
        let err = buffer.mark_exhausted(0).unwrap_err();
        assert!(matches!(err, CogroupError::Generation { shard: 0, .. }));
    }

    #[test]
    fn test_records_after_exhaustion_are_rejected() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 2);
        buffer.mark_exhausted(0).unwrap();
        let err = buffer.accept(0, key(1), 1).unwrap_err();
        assert!(matches!(err, CogroupError::Generation { shard: 0, .. }));
    }

    #[test]
    fn test_out_of_range_shard() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 2);
        assert!(matches!(
            buffer.accept(2, key(1), 1),
            Err(CogroupError::Internal { .. })
        ));
        assert!(matches!(
            buffer.mark_exhausted(5),
            Err(CogroupError::Internal { .. })
        ));
    }

    #[test]
    fn test_finish_reports_incomplete_groups() {
        let mut buffer: GroupBuffer<String, u64> = GroupBuffer::new(3, 2);
        buffer.accept(0, key(1), 1).unwrap();
        buffer.accept(0, key(2), 2).unwrap();
        buffer.accept(1, key(2), 1 << 24 | 2).unwrap().unwrap();
        buffer.mark_exhausted(0).unwrap();
        buffer.mark_exhausted(1).unwrap();

        match buffer.finish().unwrap_err() {
            CogroupError::IncompleteGroups {
                partition,
                incomplete,
                expected,
                sample,
            } => {
                assert_eq!(partition, 3);
                assert_eq!(incomplete, 1);
                assert_eq!(expected, 2);
                assert_eq!(sample, vec!["\"1\" (1/2)".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_finish_before_exhaustion_is_internal() {
        let buffer: GroupBuffer<String, u64> = GroupBuffer::new(0, 2);
        assert!(matches!(
            buffer.finish(),
            Err(CogroupError::Internal { .. })
        ));
    }
}
