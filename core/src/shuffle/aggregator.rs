//! Defines the Aggregator trait applied to each completed group.

use crate::traits::GroupedRecord;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Transform applied to every completed group before the consumer sees it.
///
/// Implementations must be free of side effects that the shuffle relies on;
/// an error aborts the whole scan.
///
/// K: Key type
/// V: Value type
pub trait Aggregator<K, V>: Send {
    /// Externally visible record shape.
    type Output;

    fn aggregate(&self, key: K, values: Vec<V>) -> anyhow::Result<Self::Output>;
}

/// Hands the grouped record through unchanged.
#[derive(Clone, Debug, Default)]
pub struct IdentityAggregator;

impl<K, V> Aggregator<K, V> for IdentityAggregator {
    type Output = GroupedRecord<K, V>;

    fn aggregate(&self, key: K, values: Vec<V>) -> anyhow::Result<Self::Output> {
        Ok(GroupedRecord::new(key, values))
    }
}

/// An aggregator built from a closure over `(key, values)`.
#[derive(Clone)]
pub struct FnAggregator<F, O> {
    func: F,
    _phantom: PhantomData<fn() -> O>,
}

impl<F, O> FnAggregator<F, O> {
    pub fn new<K, V>(func: F) -> Self
    where
        F: Fn(K, Vec<V>) -> anyhow::Result<O> + Send,
    {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<K, V, F, O> Aggregator<K, V> for FnAggregator<F, O>
where
    F: Fn(K, Vec<V>) -> anyhow::Result<O> + Send,
{
    type Output = O;

    fn aggregate(&self, key: K, values: Vec<V>) -> anyhow::Result<O> {
        (self.func)(key, values)
    }
}

impl<F, O> Debug for FnAggregator<F, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAggregator")
            .field("func", &"<function>")
            .finish()
    }
}
