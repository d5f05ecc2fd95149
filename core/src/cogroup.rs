//! The cogroup correctness job.
//!
//! Every shard emits each key of `[0, nkey)` exactly once, in its own random
//! order, tagged with the value `shard<<24 | key`. After the shuffle every
//! key must come back as one group holding one value from every shard.

use crate::session::Session;
use crate::shuffle::FnAggregator;
use crate::source::{ReadStatus, ReaderFunc, ReaderShard};
use crate::verify::{CogroupVerifier, VerificationReport};
use cogroup_common::{CogroupError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Bits reserved for the key in a packed value.
pub const SHARD_SHIFT: u32 = 24;

/// Largest key count whose keys fit below [`SHARD_SHIFT`].
pub const MAX_KEYS: usize = 1 << SHARD_SHIFT;

/// Pack a shard index and key into the value that shard emits for the key.
pub fn pack_value(shard: usize, key: u64) -> u64 {
    ((shard as u64) << SHARD_SHIFT) | key
}

/// Parameters of a cogroup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CogroupTestConfig {
    /// Number of shards
    pub nshard: usize,
    /// Number of keys per shard
    pub nkey: usize,
    /// Base seed for the per-shard permutations. Random when unset.
    pub seed: Option<u64>,
}

impl Default for CogroupTestConfig {
    fn default() -> Self {
        Self {
            nshard: 64,
            nkey: 1_000_000,
            seed: None,
        }
    }
}

impl CogroupTestConfig {
    pub fn new(nshard: usize, nkey: usize) -> Self {
        Self {
            nshard,
            nkey,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nshard == 0 {
            return Err(CogroupError::configuration_error("nshard must be positive"));
        }
        if self.nkey == 0 {
            return Err(CogroupError::configuration_error("nkey must be positive"));
        }
        if self.nkey > MAX_KEYS {
            return Err(CogroupError::configuration_error(format!(
                "nkey {} exceeds {} and would collide with the shard bits",
                self.nkey, MAX_KEYS
            )));
        }
        Ok(())
    }
}

/// Per-shard generator state, materialised on the first read.
#[derive(Debug, Default)]
pub struct PermutationState {
    order: Option<Vec<u32>>,
    next: usize,
}

fn shard_rng(seed: Option<u64>, shard: usize) -> StdRng {
    match seed {
        // Multiplying by an odd constant keeps shard seeds distinct.
        Some(base) => {
            StdRng::seed_from_u64(base ^ (shard as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        }
        None => StdRng::seed_from_u64(rand::random()),
    }
}

/// The reader behind every shard of the job.
pub fn permutation_reader(
    config: &CogroupTestConfig,
) -> ReaderFunc<PermutationState, String, u64> {
    let nkey = config.nkey as u32;
    let seed = config.seed;
    ReaderFunc::new(config.nshard, move |shard, state: &mut PermutationState, keys, values| {
        let order = state.order.get_or_insert_with(|| {
            let mut order: Vec<u32> = (0..nkey).collect();
            order.shuffle(&mut shard_rng(seed, shard));
            order
        });

        let remaining = &order[state.next..];
        let n = remaining.len().min(keys.len());
        for (i, &key) in remaining[..n].iter().enumerate() {
            keys[i] = key.to_string();
            values[i] = pack_value(shard, key as u64);
        }
        state.next += n;

        if state.next == order.len() {
            debug!(shard, "shard complete");
            Ok(ReadStatus::Exhausted(n))
        } else {
            Ok(ReadStatus::Ready(n))
        }
    })
}

/// One source per shard of the job.
pub fn permutation_sources(
    config: &CogroupTestConfig,
) -> Vec<ReaderShard<PermutationState, String, u64>> {
    permutation_reader(config).into_sources()
}

/// Run the job on `session` and verify the scan.
///
/// Engine and transform failures come back as `Err`. Verification
/// mismatches are returned inside the report.
pub async fn run_cogroup_test(
    session: &Session,
    config: &CogroupTestConfig,
) -> Result<VerificationReport> {
    config.validate()?;
    info!(nshard = config.nshard, nkey = config.nkey, "cogroup test");

    let run = session.run(permutation_sources(config))?;
    let run_id = run.run_id();
    let mut scanner = run.scan(FnAggregator::new(|key: String, values: Vec<u64>| {
        Ok((key, values))
    }));

    let mut verifier = CogroupVerifier::new(config.nshard, config.nkey);
    while let Some((key, values)) = scanner.advance().await {
        verifier.observe(&key, values);
    }
    let summary = scanner.into_result()?;

    let report = verifier.finish();
    info!(
        %run_id,
        groups = summary.groups,
        discrepancies = report.discrepancy_count,
        "cogroup test finished"
    );
    Ok(report)
}
