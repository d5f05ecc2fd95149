//! Consumer-side verification of a cogroup scan.
//!
//! Every key in `[0, nkey)` must be seen exactly once, with exactly one
//! value `shard<<24 | key` from every shard. Mismatches are logged and
//! accumulated so a single run reports all of them.

use crate::cogroup::pack_value;
use cogroup_common::{CogroupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Upper bound on the discrepancies kept in a report. All are counted.
pub const MAX_RECORDED_DISCREPANCIES: usize = 1000;

/// A single verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    MalformedKey { key: String },
    KeyOutOfRange { key: u64 },
    DuplicateKey { key: u64 },
    WrongValueCount { key: u64, got: usize, want: usize },
    WrongValue { key: u64, got: u64, want: u64 },
    MissingKey { key: u64 },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::MalformedKey { key } => write!(f, "malformed key {key:?}"),
            Discrepancy::KeyOutOfRange { key } => write!(f, "key {key} out of range"),
            Discrepancy::DuplicateKey { key } => write!(f, "saw key {key} multiple times"),
            Discrepancy::WrongValueCount { key, got, want } => {
                write!(f, "wrong number of values for key {key}: got {got}, want {want}")
            }
            Discrepancy::WrongValue { key, got, want } => {
                write!(f, "wrong value for key {key}: got {got}, want {want}")
            }
            Discrepancy::MissingKey { key } => write!(f, "did not see key {key}"),
        }
    }
}

/// Result of verifying a full scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub nshard: usize,
    pub nkey: usize,
    /// Groups observed, including duplicates and rejected keys.
    pub groups_seen: u64,
    /// Total number of discrepancies found.
    pub discrepancy_count: usize,
    /// The first [`MAX_RECORDED_DISCREPANCIES`] discrepancies.
    pub discrepancies: Vec<Discrepancy>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.discrepancy_count == 0
    }

    /// Convert a failing report into a [`CogroupError::Verification`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }
        Err(CogroupError::Verification {
            discrepancies: self.discrepancy_count,
            first: self
                .discrepancies
                .first()
                .map(ToString::to_string)
                .unwrap_or_default(),
        })
    }
}

/// Checks grouped records against the expected cogroup output.
#[derive(Debug)]
pub struct CogroupVerifier {
    nshard: usize,
    nkey: usize,
    seen: Vec<bool>,
    groups_seen: u64,
    discrepancy_count: usize,
    discrepancies: Vec<Discrepancy>,
}

impl CogroupVerifier {
    pub fn new(nshard: usize, nkey: usize) -> Self {
        Self {
            nshard,
            nkey,
            seen: vec![false; nkey],
            groups_seen: 0,
            discrepancy_count: 0,
            discrepancies: Vec::new(),
        }
    }

    /// Check one grouped record. Values may arrive in any order.
    pub fn observe(&mut self, key: &str, mut values: Vec<u64>) {
        self.groups_seen += 1;

        let key = match key.parse::<u64>() {
            Ok(key) => key,
            Err(_) => {
                self.record(Discrepancy::MalformedKey {
                    key: key.to_string(),
                });
                return;
            }
        };
        let index = match usize::try_from(key) {
            Ok(index) if index < self.seen.len() => index,
            _ => {
                self.record(Discrepancy::KeyOutOfRange { key });
                return;
            }
        };
        if std::mem::replace(&mut self.seen[index], true) {
            self.record(Discrepancy::DuplicateKey { key });
        }

        if values.len() != self.nshard {
            self.record(Discrepancy::WrongValueCount {
                key,
                got: values.len(),
                want: self.nshard,
            });
            return;
        }
        values.sort_unstable();
        for (shard, got) in values.into_iter().enumerate() {
            let want = pack_value(shard, key);
            if got != want {
                self.record(Discrepancy::WrongValue { key, got, want });
            }
        }
    }

    /// Check that no key was missed and produce the report.
    pub fn finish(mut self) -> VerificationReport {
        let missing: Vec<u64> = self
            .seen
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(key, _)| key as u64)
            .collect();
        for key in missing {
            self.record(Discrepancy::MissingKey { key });
        }
        VerificationReport {
            nshard: self.nshard,
            nkey: self.nkey,
            groups_seen: self.groups_seen,
            discrepancy_count: self.discrepancy_count,
            discrepancies: self.discrepancies,
        }
    }

    fn record(&mut self, discrepancy: Discrepancy) {
        error!("{}", discrepancy);
        self.discrepancy_count += 1;
        if self.discrepancies.len() < MAX_RECORDED_DISCREPANCIES {
            self.discrepancies.push(discrepancy);
        }
    }
}
