//! Common test utilities and helpers for integration tests

use cogroup_core::cogroup::pack_value;
use cogroup_core::{Session, ShuffleConfigBuilder, VecSource};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Create a session with explicit shuffle parameters
pub fn create_test_session(partitions: u32, batch_size: usize, capacity: usize) -> Session {
    let config = ShuffleConfigBuilder::new()
        .num_partitions(partitions)
        .batch_size(batch_size)
        .channel_capacity(capacity)
        .build()
        .unwrap();
    Session::new(config).unwrap()
}

/// Records of one shard: every key in `keys` with its packed value
pub fn shard_records(shard: usize, keys: &[u64]) -> Vec<(String, u64)> {
    keys.iter()
        .map(|&k| (k.to_string(), pack_value(shard, k)))
        .collect()
}

/// One in-memory source per shard, each holding every key of `[0, nkey)`
/// in a seeded random order
#[allow(dead_code)] // Not every test binary shuffles its sources
pub fn shuffled_sources(nshard: usize, nkey: u64, seed: u64) -> Vec<VecSource<String, u64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..nshard)
        .map(|shard| {
            let mut keys: Vec<u64> = (0..nkey).collect();
            keys.shuffle(&mut rng);
            VecSource::new(shard, shard_records(shard, &keys))
        })
        .collect()
}
