//! Sessions and run handles
//!
//! A [`Session`] carries the shuffle configuration and a cancellation token
//! shared by every run it starts. [`Session::run`] validates its input,
//! starts the shard producers and partition reducers, and returns a
//! [`ShuffleRun`] whose [`scan`](ShuffleRun::scan) yields the grouped
//! records.

use crate::scan::Scanner;
use crate::shuffle::{
    Aggregator, HashPartitionable, HashPartitioner, Partitioner, ShuffleEngine, ShuffleTasks,
};
use crate::source::ShardSource;
use crate::traits::{ShuffleKey, ShuffleValue};
use cogroup_common::{CogroupError, Result, ShuffleConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, info_span};
use uuid::Uuid;

/// Entry point for running shuffles.
#[derive(Debug, Clone)]
pub struct Session {
    config: ShuffleConfig,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session with its own cancellation token.
    pub fn new(config: ShuffleConfig) -> Result<Self> {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Create a session that stops when `cancel` is cancelled.
    pub fn with_cancellation(config: ShuffleConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, cancel })
    }

    pub fn config(&self) -> &ShuffleConfig {
        &self.config
    }

    /// The token observed by every run of this session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every run started by this session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Start a shuffle over `sources`, routing keys with a [`HashPartitioner`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run<K, V, S>(&self, sources: Vec<S>) -> Result<ShuffleRun<K, V>>
    where
        K: ShuffleKey + HashPartitionable,
        V: ShuffleValue,
        S: ShardSource<K, V> + 'static,
    {
        let partitioner: Arc<dyn Partitioner<K>> =
            Arc::new(HashPartitioner::new(self.config.num_partitions));
        self.run_with_partitioner(sources, partitioner)
    }

    /// Start a shuffle over `sources` with a caller-chosen partitioner.
    pub fn run_with_partitioner<K, V, S>(
        &self,
        sources: Vec<S>,
        partitioner: Arc<dyn Partitioner<K>>,
    ) -> Result<ShuffleRun<K, V>>
    where
        K: ShuffleKey,
        V: ShuffleValue,
        S: ShardSource<K, V> + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(CogroupError::Cancelled);
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("shuffle_run", %run_id);
        let num_shards = sources.len();

        let engine = ShuffleEngine::new(self.config.clone(), partitioner)?;
        let num_partitions = engine.num_partitions();
        let stages = engine.start(sources, self.cancel.child_token(), span.clone())?;

        info!(parent: &span, num_shards, num_partitions, "shuffle run started");

        Ok(ShuffleRun {
            run_id,
            num_shards,
            num_partitions,
            stages,
            cancel: self.cancel.clone(),
            span,
        })
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            config: ShuffleConfig::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Handle to a started shuffle.
pub struct ShuffleRun<K, V> {
    run_id: Uuid,
    num_shards: usize,
    num_partitions: u32,
    stages: ShuffleTasks<K, V>,
    cancel: CancellationToken,
    span: Span,
}

impl<K: ShuffleKey, V: ShuffleValue> ShuffleRun<K, V> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Scan the grouped records, passing each through `aggregator`.
    pub fn scan<A: Aggregator<K, V>>(self, aggregator: A) -> Scanner<K, V, A> {
        Scanner::new(self.run_id, self.stages, aggregator, self.cancel, self.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::{CustomPartitioner, IdentityAggregator};
    use crate::source::VecSource;
    use cogroup_common::ShuffleConfigBuilder;
    use std::collections::HashMap;

    fn source(shard: usize, keys: &[&str]) -> VecSource<String, u64> {
        VecSource::new(
            shard,
            keys.iter().map(|k| (k.to_string(), shard as u64)).collect(),
        )
    }

    #[tokio::test]
    async fn test_run_reports_shape() {
        let config = ShuffleConfigBuilder::new().num_partitions(5).build().unwrap();
        let session = Session::new(config).unwrap();
        let run = session
            .run(vec![source(0, &["a", "b"]), source(1, &["b", "a"])])
            .unwrap();
        assert_eq!(run.num_shards(), 2);
        assert_eq!(run.num_partitions(), 5);

        let mut scanner = run.scan(IdentityAggregator);
        let mut groups = HashMap::new();
        while let Some(group) = scanner.advance().await {
            let mut values = group.values;
            values.sort();
            groups.insert(group.key, values);
        }
        assert!(scanner.err().is_none());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a"], vec![0, 1]);
        assert_eq!(groups["b"], vec![0, 1]);
    }

    #[tokio::test]
    async fn test_run_with_skewed_partitioner() {
        // Everything lands on one partition; grouping must not care.
        let partitioner: Arc<dyn Partitioner<String>> =
            Arc::new(CustomPartitioner::new(4, |_: &String| 2));
        let session = Session::default();
        let run = session
            .run_with_partitioner(
                vec![
                    source(0, &["x", "y", "z"]),
                    source(1, &["z", "y", "x"]),
                    source(2, &["y", "x", "z"]),
                ],
                partitioner,
            )
            .unwrap();

        let mut scanner = run.scan(IdentityAggregator);
        let mut count = 0;
        while let Some(group) = scanner.advance().await {
            assert_eq!(group.len(), 3);
            count += 1;
        }
        assert!(scanner.err().is_none());
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_cancelled_session_refuses_new_runs() {
        let session = Session::default();
        session.cancel();
        let result = session.run(vec![source(0, &["a"])]);
        assert!(matches!(result, Err(CogroupError::Cancelled)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ShuffleConfig {
            num_partitions: 0,
            ..ShuffleConfig::default()
        };
        assert!(matches!(
            Session::new(config),
            Err(CogroupError::Configuration { .. })
        ));
    }
}
