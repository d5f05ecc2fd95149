//! Cogroup Core - shuffle and cogroup engine
//!
//! Records produced by a set of shards are partitioned by key, grouped so
//! that each key yields exactly one record holding one value from every
//! shard, and handed to the caller through a pull-based [`Scanner`].
//! The [`cogroup`] module drives the engine with a self-checking workload.

pub mod cogroup;
pub mod scan;
pub mod session;
pub mod shuffle;
pub mod source;
pub mod traits;
pub mod verify;

pub use cogroup::{CogroupTestConfig, run_cogroup_test};
pub use cogroup_common::{CogroupError, ErrorCategory, Result, ShuffleConfig, ShuffleConfigBuilder};
pub use scan::{ScanState, ScanSummary, Scanner};
pub use session::{Session, ShuffleRun};
pub use source::{ReadStatus, ReaderFunc, ShardSource, VecSource};
pub use traits::{GroupedRecord, ShuffleKey, ShuffleValue};
pub use verify::{CogroupVerifier, Discrepancy, VerificationReport};
