//! Core components for shuffle operations.

pub mod aggregator;
pub mod buffer;
pub mod engine;
pub mod partitioner;

pub use aggregator::*;
pub use buffer::*;
pub use engine::*;
pub use partitioner::*;
