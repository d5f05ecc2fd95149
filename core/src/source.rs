//! Shard sources
//!
//! A shard source produces a bounded, shard-local sequence of records in
//! batches written into caller-supplied buffers. End of data is signalled
//! explicitly with [`ReadStatus::Exhausted`], which is distinct from a
//! transient empty batch.

use crate::traits::{ShuffleKey, ShuffleValue};
use cogroup_common::{CogroupError, Result};
use std::fmt::Debug;
use std::sync::Arc;

/// Outcome of a single read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` records were written and more may follow. `Ready(0)` is a
    /// transient empty batch.
    Ready(usize),
    /// `n` records were written and the shard has nothing more to give.
    Exhausted(usize),
}

impl ReadStatus {
    /// Number of records written by the call.
    pub fn count(&self) -> usize {
        match *self {
            ReadStatus::Ready(n) | ReadStatus::Exhausted(n) => n,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ReadStatus::Exhausted(_))
    }
}

/// A source of records owned by a single shard.
pub trait ShardSource<K, V>: Send {
    /// The shard index in `[0, nshard)`.
    fn shard(&self) -> usize;

    /// Write the next batch into `keys[..n]` and `values[..n]`.
    ///
    /// Implementations must never write more than `keys.len()` records and
    /// must never re-emit a record once it has been returned.
    fn read(&mut self, keys: &mut [K], values: &mut [V]) -> Result<ReadStatus>;
}

impl<K, V> ShardSource<K, V> for Box<dyn ShardSource<K, V>> {
    fn shard(&self) -> usize {
        (**self).shard()
    }

    fn read(&mut self, keys: &mut [K], values: &mut [V]) -> Result<ReadStatus> {
        (**self).read(keys, values)
    }
}

/// Type alias for the shared reader closure of a [`ReaderFunc`].
pub type ReaderFn<S, K, V> =
    dyn Fn(usize, &mut S, &mut [K], &mut [V]) -> Result<ReadStatus> + Send + Sync;

/// Builds one source per shard from a single reader closure.
///
/// Each shard owns a private `S` state, created with `S::default()` and
/// passed by `&mut` into every call for that shard. This is where lazily
/// initialised per-shard generators keep their position.
pub struct ReaderFunc<S, K, V> {
    num_shards: usize,
    reader: Arc<ReaderFn<S, K, V>>,
}

impl<S, K, V> ReaderFunc<S, K, V>
where
    S: Default + Send + 'static,
    K: ShuffleKey,
    V: ShuffleValue,
{
    pub fn new<F>(num_shards: usize, reader: F) -> Self
    where
        F: Fn(usize, &mut S, &mut [K], &mut [V]) -> Result<ReadStatus> + Send + Sync + 'static,
    {
        Self {
            num_shards,
            reader: Arc::new(reader),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Split into one independent source per shard.
    pub fn into_sources(self) -> Vec<ReaderShard<S, K, V>> {
        (0..self.num_shards)
            .map(|shard| ReaderShard {
                shard,
                state: S::default(),
                reader: Arc::clone(&self.reader),
                exhausted: false,
            })
            .collect()
    }
}

impl<S, K, V> Debug for ReaderFunc<S, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderFunc")
            .field("num_shards", &self.num_shards)
            .field("reader", &"<function>")
            .finish()
    }
}

/// A single shard of a [`ReaderFunc`].
pub struct ReaderShard<S, K, V> {
    shard: usize,
    state: S,
    reader: Arc<ReaderFn<S, K, V>>,
    exhausted: bool,
}

impl<S, K, V> ReaderShard<S, K, V> {
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl<S, K, V> ShardSource<K, V> for ReaderShard<S, K, V>
where
    S: Send,
    K: ShuffleKey,
    V: ShuffleValue,
{
    fn shard(&self) -> usize {
        self.shard
    }

    fn read(&mut self, keys: &mut [K], values: &mut [V]) -> Result<ReadStatus> {
        // The reader is not consulted again once it has reported the end.
        if self.exhausted {
            return Ok(ReadStatus::Exhausted(0));
        }

        let status = (self.reader)(self.shard, &mut self.state, keys, values)?;
        let capacity = keys.len().min(values.len());
        if status.count() > capacity {
            return Err(CogroupError::generation_error(
                self.shard,
                format!(
                    "reader wrote {} records into a buffer of {}",
                    status.count(),
                    capacity
                ),
            ));
        }
        if status.is_exhausted() {
            self.exhausted = true;
        }
        Ok(status)
    }
}

/// A shard source backed by an in-memory list of records, emitted in order.
#[derive(Debug, Clone)]
pub struct VecSource<K, V> {
    shard: usize,
    records: std::vec::IntoIter<(K, V)>,
}

impl<K, V> VecSource<K, V> {
    pub fn new(shard: usize, records: Vec<(K, V)>) -> Self {
        Self {
            shard,
            records: records.into_iter(),
        }
    }
}

impl<K, V> ShardSource<K, V> for VecSource<K, V>
where
    K: ShuffleKey,
    V: ShuffleValue,
{
    fn shard(&self) -> usize {
        self.shard
    }

    fn read(&mut self, keys: &mut [K], values: &mut [V]) -> Result<ReadStatus> {
        let capacity = keys.len().min(values.len());
        let mut n = 0;
        while n < capacity {
            match self.records.next() {
                Some((key, value)) => {
                    keys[n] = key;
                    values[n] = value;
                    n += 1;
                }
                None => break,
            }
        }
        if self.records.len() == 0 {
            Ok(ReadStatus::Exhausted(n))
        } else {
            Ok(ReadStatus::Ready(n))
        }
    }
}
