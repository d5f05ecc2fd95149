//! Defines partitioners for distributing data in a shuffle.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Maps a key to the partition that groups it.
///
/// The mapping must depend on the key alone: never on the value, the shard
/// that produced it, or the order records arrive in.
pub trait Partitioner<K>: Send + Sync {
    fn num_partitions(&self) -> u32;

    fn get_partition(&self, key: &K) -> u32;
}

/// A partitioner that uses the hash of the key to distribute data.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    num_partitions: u32,
}

impl HashPartitioner {
    pub fn new(num_partitions: u32) -> Self {
        assert!(num_partitions > 0, "Number of partitions must be positive.");
        Self { num_partitions }
    }
}

impl<K: HashPartitionable> Partitioner<K> for HashPartitioner {
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn get_partition(&self, key: &K) -> u32 {
        key.get_partition(self.num_partitions)
    }
}

/// A specific partitioner for types that implement Hash
pub trait HashPartitionable: Hash + Send + Sync {
    fn get_partition(&self, num_partitions: u32) -> u32 {
        // DefaultHasher::new uses fixed keys, so the result is the same in
        // every shard and every process built from the same toolchain.
        let mut s = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut s);
        (s.finish() % num_partitions as u64) as u32
    }
}

impl HashPartitionable for String {}

/// A custom partitioner that allows users to define their own partitioning logic.
#[derive(Clone)]
pub struct CustomPartitioner<K> {
    num_partitions: u32,
    partition_func: fn(&K) -> u32,
    _phantom: PhantomData<fn(&K)>,
}

impl<K> CustomPartitioner<K>
where
    K: Send + Sync + 'static,
{
    pub fn new(num_partitions: u32, partition_func: fn(&K) -> u32) -> Self {
        assert!(num_partitions > 0, "Number of partitions must be positive.");
        Self {
            num_partitions,
            partition_func,
            _phantom: PhantomData,
        }
    }

    pub fn get_partition_for(&self, key: &K) -> u32 {
        let partition = (self.partition_func)(key);
        partition % self.num_partitions
    }
}

impl<K> Partitioner<K> for CustomPartitioner<K>
where
    K: Send + Sync + 'static,
{
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn get_partition(&self, key: &K) -> u32 {
        self.get_partition_for(key)
    }
}

impl<K> std::fmt::Debug for CustomPartitioner<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomPartitioner")
            .field("num_partitions", &self.num_partitions)
            .field("partition_func", &"<function>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_partitioner_is_stable() {
        let partitioner = HashPartitioner::new(8);
        for key in 0..1000 {
            let key = key.to_string();
            let first = Partitioner::<String>::get_partition(&partitioner, &key);
            let again = Partitioner::<String>::get_partition(&partitioner.clone(), &key);
            assert_eq!(first, again);
            assert!(first < 8);
        }
    }

    #[test]
    fn test_hash_partitioner_spreads_keys() {
        let partitioner = HashPartitioner::new(4);
        let mut counts = [0usize; 4];
        for key in 0..4000 {
            let p = Partitioner::<String>::get_partition(&partitioner, &key.to_string());
            counts[p as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 0), "counts: {counts:?}");
    }

    #[test]
    fn test_single_partition() {
        let partitioner = HashPartitioner::new(1);
        assert_eq!(Partitioner::<String>::num_partitions(&partitioner), 1);
        assert_eq!(
            Partitioner::<String>::get_partition(&partitioner, &"anything".to_string()),
            0
        );
    }

    #[test]
    #[should_panic(expected = "Number of partitions must be positive.")]
    fn test_zero_partitions_panics() {
        HashPartitioner::new(0);
    }

    #[test]
    fn test_custom_partitioner_wraps_out_of_range() {
        let partitioner = CustomPartitioner::new(3, |key: &String| key.len() as u32);
        assert_eq!(partitioner.num_partitions(), 3);
        assert_eq!(partitioner.get_partition(&"ab".to_string()), 2);
        assert_eq!(partitioner.get_partition(&"abcd".to_string()), 1);
        assert!(format!("{partitioner:?}").contains("<function>"));
    }
}
