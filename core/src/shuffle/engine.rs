//! Shuffle engine
//!
//! One producer task per shard reads batches from its [`ShardSource`],
//! routes every record through the [`Partitioner`] and sends it to the
//! inbound channel of the destination partition. One reducer task per
//! partition exclusively owns that partition's [`GroupBuffer`] and forwards
//! completed groups onto a single output channel read by the scan consumer.
//! Source reads run on the blocking pool, leaving the async workers free for
//! routing, grouping and cancellation.
//!
//! Because each buffer has exactly one writer there is no locking, and a
//! group leaves its buffer before it is sent, so the consumer never sees a
//! key that can still be appended to.
//!
//! Any stage failure trips the run's abort token first and is then sent on
//! the output channel, so the consumer observes the original error rather
//! than a secondary one.

use crate::shuffle::{GroupBuffer, Partitioner};
use crate::source::{ReadStatus, ShardSource};
use crate::traits::{GroupedRecord, ShuffleKey, ShuffleValue};
use cogroup_common::{CogroupError, Result, ShuffleConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, error};

/// Message sent from a shard producer to a partition reducer.
#[derive(Debug)]
pub enum ShardMessage<K, V> {
    /// Records of one batch that hash to the receiving partition.
    Records { shard: usize, records: Vec<(K, V)> },
    /// The shard will send nothing more.
    Exhausted { shard: usize },
}

/// Item delivered to the scan consumer.
pub type GroupResult<K, V> = Result<GroupedRecord<K, V>>;

/// The running stages of a started shuffle.
pub struct ShuffleTasks<K, V> {
    /// Completed groups, or the first error raised by any stage.
    pub output: mpsc::Receiver<GroupResult<K, V>>,
    /// Producer and reducer tasks. Dropping the set aborts them.
    pub tasks: JoinSet<()>,
    /// Tripped by any failing stage, or by cancellation of its parent token.
    pub abort: CancellationToken,
}

/// Wires shard sources to partition reducers.
pub struct ShuffleEngine<K> {
    config: ShuffleConfig,
    partitioner: Arc<dyn Partitioner<K>>,
}

impl<K: ShuffleKey> ShuffleEngine<K> {
    pub fn new(config: ShuffleConfig, partitioner: Arc<dyn Partitioner<K>>) -> Result<Self> {
        config.validate()?;
        if partitioner.num_partitions() == 0 {
            return Err(CogroupError::configuration_error(
                "partitioner must have at least one partition",
            ));
        }
        Ok(Self {
            config,
            partitioner,
        })
    }

    pub fn num_partitions(&self) -> u32 {
        self.partitioner.num_partitions()
    }

    /// Spawn one producer per source and one reducer per partition.
    ///
    /// Sources must cover shards `0..sources.len()` exactly once each.
    /// Must be called from within a Tokio runtime.
    pub fn start<V, S>(
        &self,
        sources: Vec<S>,
        abort: CancellationToken,
        span: Span,
    ) -> Result<ShuffleTasks<K, V>>
    where
        V: ShuffleValue,
        S: ShardSource<K, V> + 'static,
    {
        let num_shards = check_shards::<K, V, S>(&sources)?;
        let num_partitions = self.num_partitions();
        let capacity = self.config.channel_capacity;

        let (output_tx, output_rx) = mpsc::channel(capacity);
        let mut tasks = JoinSet::new();
        let mut partition_txs = Vec::with_capacity(num_partitions as usize);

        for partition in 0..num_partitions {
            let (tx, rx) = mpsc::channel(capacity);
            partition_txs.push(tx);

            let mut reducer = PartitionReducer {
                buffer: GroupBuffer::new(partition, num_shards),
                inbound: rx,
                output: output_tx.clone(),
                abort: abort.clone(),
            };
            let output = output_tx.clone();
            let abort = abort.clone();
            tasks.spawn(
                async move {
                    let result = reducer.run().await;
                    report_failure(result, &output, &abort).await;
                    drop(reducer);
                }
                .instrument(debug_span!(parent: &span, "reducer", partition)),
            );
        }

        for source in sources {
            let shard = source.shard();
            let mut producer = ShardProducer {
                source: Some(source),
                shard,
                partitioner: Arc::clone(&self.partitioner),
                partitions: partition_txs.clone(),
                keys: vec![K::default(); self.config.batch_size],
                values: vec![V::default(); self.config.batch_size],
                abort: abort.clone(),
            };
            let output = output_tx.clone();
            let abort = abort.clone();
            tasks.spawn(
                async move {
                    let result = producer.run().await;
                    report_failure(result, &output, &abort).await;
                    drop(producer);
                }
                .instrument(debug_span!(parent: &span, "shard", shard)),
            );
        }

        debug!(
            parent: &span,
            num_shards, num_partitions, "shuffle stages started"
        );

        Ok(ShuffleTasks {
            output: output_rx,
            tasks,
            abort,
        })
    }
}

/// Validate that the sources cover `0..n` exactly once and return `n`.
fn check_shards<K, V, S: ShardSource<K, V>>(sources: &[S]) -> Result<usize> {
    let num_shards = sources.len();
    if num_shards == 0 {
        return Err(CogroupError::configuration_error(
            "at least one shard source is required",
        ));
    }
    let mut seen = vec![false; num_shards];
    for source in sources {
        let shard = source.shard();
        if shard >= num_shards {
            return Err(CogroupError::configuration_error(format!(
                "shard index {shard} out of range for {num_shards} sources"
            )));
        }
        if std::mem::replace(&mut seen[shard], true) {
            return Err(CogroupError::configuration_error(format!(
                "shard index {shard} appears more than once"
            )));
        }
    }
    Ok(num_shards)
}

/// Abort the run and surface a stage error to the consumer.
///
/// The caller keeps its channel endpoints alive until this returns, so
/// other stages see the abort before they see a closed channel.
async fn report_failure<K, V>(
    result: Result<()>,
    output: &mpsc::Sender<GroupResult<K, V>>,
    abort: &CancellationToken,
) {
    match result {
        Ok(()) => {}
        Err(CogroupError::Cancelled) => abort.cancel(),
        Err(e) => {
            error!("shuffle stage failed: {}", e);
            abort.cancel();
            // The consumer may already be gone, in which case nobody is listening.
            let _ = output.send(Err(e)).await;
        }
    }
}

/// Reads one shard and routes its records to partitions.
///
/// Reads run on the blocking pool with the batch buffers moved in and back
/// out, so a slow or CPU-heavy source never stalls the async workers.
struct ShardProducer<K, V, S> {
    /// Absent only while a read is in flight.
    source: Option<S>,
    shard: usize,
    partitioner: Arc<dyn Partitioner<K>>,
    partitions: Vec<mpsc::Sender<ShardMessage<K, V>>>,
    keys: Vec<K>,
    values: Vec<V>,
    abort: CancellationToken,
}

impl<K, V, S> ShardProducer<K, V, S>
where
    K: ShuffleKey,
    V: ShuffleValue,
    S: ShardSource<K, V> + 'static,
{
    async fn run(&mut self) -> Result<()> {
        let num_partitions = self.partitions.len();
        let mut emitted = 0u64;

        loop {
            let Some(status) = self.read_batch().await? else {
                return Ok(());
            };
            let n = status.count();
            let capacity = self.keys.len();
            if n > capacity {
                return Err(CogroupError::generation_error(
                    self.shard,
                    format!("source wrote {n} records into a buffer of {capacity}"),
                ));
            }

            if n > 0 {
                let mut buckets: Vec<Vec<(K, V)>> =
                    (0..num_partitions).map(|_| Vec::new()).collect();
                for (key, value) in self.keys[..n].iter_mut().zip(self.values[..n].iter_mut()) {
                    let partition = self.partitioner.get_partition(key) as usize;
                    if partition >= num_partitions {
                        return Err(CogroupError::internal_error(format!(
                            "partitioner returned {partition} for {num_partitions} partitions"
                        )));
                    }
                    buckets[partition].push((std::mem::take(key), std::mem::take(value)));
                }
                for (partition, records) in buckets.into_iter().enumerate() {
                    if records.is_empty() {
                        continue;
                    }
                    let message = ShardMessage::Records {
                        shard: self.shard,
                        records,
                    };
                    if !send_or_abort(&self.partitions[partition], &self.abort, message).await? {
                        return Ok(());
                    }
                }
                emitted += n as u64;
            }

            if status.is_exhausted() {
                for partition in 0..num_partitions {
                    let message = ShardMessage::Exhausted { shard: self.shard };
                    if !send_or_abort(&self.partitions[partition], &self.abort, message).await? {
                        return Ok(());
                    }
                }
                debug!(shard = self.shard, records = emitted, "shard complete");
                return Ok(());
            }

            if n == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Read the next batch off the async runtime.
    ///
    /// Returns `None` if the run is aborted first. The in-flight read is then
    /// left to finish on its own and its result is discarded.
    async fn read_batch(&mut self) -> Result<Option<ReadStatus>> {
        if self.abort.is_cancelled() {
            return Ok(None);
        }
        let Some(mut source) = self.source.take() else {
            return Err(CogroupError::internal_error(format!(
                "shard {} read after its source was lost",
                self.shard
            )));
        };
        let mut keys = std::mem::take(&mut self.keys);
        let mut values = std::mem::take(&mut self.values);
        let span = Span::current();

        let read = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let status = source.read(&mut keys, &mut values);
            (source, keys, values, status)
        });
        let joined = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Ok(None),
            joined = read => joined,
        };

        match joined {
            Ok((source, keys, values, status)) => {
                self.source = Some(source);
                self.keys = keys;
                self.values = values;
                status.map(Some)
            }
            Err(e) => Err(CogroupError::generation_error_with_source(
                self.shard,
                "shard source did not return from a read",
                e,
            )),
        }
    }
}

/// Send to a partition reducer unless the run is aborted first.
///
/// Returns false if the run was aborted while waiting for capacity.
async fn send_or_abort<K, V>(
    partition: &mpsc::Sender<ShardMessage<K, V>>,
    abort: &CancellationToken,
    message: ShardMessage<K, V>,
) -> Result<bool> {
    tokio::select! {
        _ = abort.cancelled() => Ok(false),
        sent = partition.send(message) => match sent {
            Ok(()) => Ok(true),
            Err(_) if abort.is_cancelled() => Ok(false),
            Err(_) => Err(CogroupError::internal_error(
                "partition reducer stopped before its producers",
            )),
        },
    }
}

/// Groups the records of one partition.
struct PartitionReducer<K, V> {
    buffer: GroupBuffer<K, V>,
    inbound: mpsc::Receiver<ShardMessage<K, V>>,
    output: mpsc::Sender<GroupResult<K, V>>,
    abort: CancellationToken,
}

impl<K: ShuffleKey, V: ShuffleValue> PartitionReducer<K, V> {
    async fn run(&mut self) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = self.abort.cancelled() => return Ok(()),
                message = self.inbound.recv() => message,
            };

            match message {
                Some(ShardMessage::Records { shard, records }) => {
                    for (key, value) in records {
                        if let Some(group) = self.buffer.accept(shard, key, value)? {
                            if !emit_group(&self.output, &self.abort, group).await {
                                return Ok(());
                            }
                        }
                    }
                }
                Some(ShardMessage::Exhausted { shard }) => {
                    if self.buffer.mark_exhausted(shard)? {
                        self.buffer.finish()?;
                        debug!(
                            partition = self.buffer.partition(),
                            groups = self.buffer.completed_len(),
                            records = self.buffer.records_seen(),
                            "partition complete"
                        );
                        return Ok(());
                    }
                }
                None => {
                    if self.abort.is_cancelled() {
                        return Ok(());
                    }
                    let live = self.buffer.live_shards();
                    return Err(CogroupError::generation_error(
                        live.first().copied().unwrap_or_default(),
                        format!(
                            "shards {:?} stopped without signalling exhaustion to partition {}",
                            live,
                            self.buffer.partition()
                        ),
                    ));
                }
            }
        }
    }
}

/// Hand a completed group to the consumer.
///
/// Returns false if the run was aborted or the consumer went away.
async fn emit_group<K, V>(
    output: &mpsc::Sender<GroupResult<K, V>>,
    abort: &CancellationToken,
    group: GroupedRecord<K, V>,
) -> bool {
    tokio::select! {
        _ = abort.cancelled() => false,
        sent = output.send(Ok(group)) => sent.is_ok(),
    }
}
