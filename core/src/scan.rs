//! Scan consumer
//!
//! A [`Scanner`] pulls completed groups out of a running shuffle one at a
//! time, applies the run's [`Aggregator`] and tracks the scan state:
//!
//! ```text
//! Ready -> Scanning -> Exhausted
//!                   \-> Errored
//! ```
//!
//! [`Scanner::advance`] returns `None` both at the clean end and on failure;
//! callers must check [`Scanner::err`] (or [`Scanner::into_result`]) once it
//! does. Exhaustion only means the engine has no more groups to give. Global
//! completeness is for the consumer to verify.

use crate::shuffle::{Aggregator, ShuffleTasks};
use crate::traits::{ShuffleKey, ShuffleValue};
use cogroup_common::{CogroupError, Result};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No group has been requested yet.
    Ready,
    /// Groups are being pulled.
    Scanning,
    /// The engine delivered every group it had.
    Exhausted,
    /// A stage, the aggregator or cancellation ended the scan.
    Errored,
}

/// Outcome of a scan that ran to exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub groups: u64,
}

/// Pull-based reader over the groups of one shuffle run.
pub struct Scanner<K, V, A> {
    run_id: Uuid,
    state: ScanState,
    stages: ShuffleTasks<K, V>,
    aggregator: A,
    cancel: CancellationToken,
    error: Option<CogroupError>,
    groups: u64,
    span: Span,
}

impl<K, V, A> Scanner<K, V, A>
where
    K: ShuffleKey,
    V: ShuffleValue,
    A: Aggregator<K, V>,
{
    pub(crate) fn new(
        run_id: Uuid,
        stages: ShuffleTasks<K, V>,
        aggregator: A,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            run_id,
            state: ScanState::Ready,
            stages,
            aggregator,
            cancel,
            error: None,
            groups: 0,
            span,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Number of groups handed out so far.
    pub fn groups_scanned(&self) -> u64 {
        self.groups
    }

    /// The error that ended the scan, if any.
    pub fn err(&self) -> Option<&CogroupError> {
        self.error.as_ref()
    }

    /// Wait for the next completed group.
    ///
    /// Returns `None` once the scan is exhausted or has failed. Cancellation
    /// of the session token is observed ahead of any buffered groups.
    pub async fn advance(&mut self) -> Option<A::Output> {
        match self.state {
            ScanState::Exhausted | ScanState::Errored => return None,
            ScanState::Ready => {
                debug!(parent: &self.span, "scan started");
                self.state = ScanState::Scanning;
            }
            ScanState::Scanning => {}
        }

        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.fail(CogroupError::Cancelled);
                return None;
            }
            item = self.stages.output.recv() => item,
        };

        match item {
            Some(Ok(group)) => {
                let (key, values) = group.into_parts();
                let described = key.clone();
                match self.aggregator.aggregate(key, values) {
                    Ok(output) => {
                        self.groups += 1;
                        Some(output)
                    }
                    Err(e) => {
                        self.fail(CogroupError::transform_error(format!("{described:?}"), e));
                        None
                    }
                }
            }
            Some(Err(e)) => {
                self.fail(e);
                None
            }
            None => {
                self.complete().await;
                None
            }
        }
    }

    /// Every stage has dropped its end of the output channel.
    async fn complete(&mut self) {
        while let Some(joined) = self.stages.tasks.join_next().await {
            if let Err(e) = joined {
                self.fail(CogroupError::internal_error_with_source(
                    "shuffle stage task did not finish",
                    e,
                ));
                return;
            }
        }
        // Stages exit quietly when aborted, so a closed channel alone does
        // not mean every group was delivered.
        if self.cancel.is_cancelled() || self.stages.abort.is_cancelled() {
            self.fail(CogroupError::Cancelled);
            return;
        }
        self.state = ScanState::Exhausted;
        info!(parent: &self.span, groups = self.groups, "scan exhausted");
    }

    fn fail(&mut self, error: CogroupError) {
        if self.state == ScanState::Errored {
            return;
        }
        if error.is_cancelled() {
            warn!(parent: &self.span, groups = self.groups, "scan cancelled");
        } else {
            warn!(parent: &self.span, groups = self.groups, "scan failed: {}", error);
        }
        self.stages.abort.cancel();
        self.error = Some(error);
        self.state = ScanState::Errored;
    }

    /// Finish the scan, returning the error that ended it if there was one.
    pub fn into_result(self) -> Result<ScanSummary> {
        match self.state {
            ScanState::Exhausted => Ok(ScanSummary {
                run_id: self.run_id,
                groups: self.groups,
            }),
            ScanState::Errored => Err(self
                .error
                .unwrap_or_else(|| CogroupError::internal_error("scan errored without an error"))),
            ScanState::Ready | ScanState::Scanning => {
                self.stages.abort.cancel();
                Err(CogroupError::internal_error(
                    "scan abandoned before exhaustion",
                ))
            }
        }
    }

    /// Turn the scanner into a stream of outputs, ending with the error that
    /// stopped it, if any.
    pub fn into_stream(self) -> impl Stream<Item = Result<A::Output>> {
        futures::stream::unfold(Some(self), |scanner| async move {
            let mut scanner = scanner?;
            match scanner.advance().await {
                Some(output) => Some((Ok(output), Some(scanner))),
                None => scanner.error.take().map(|e| (Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::shuffle::{FnAggregator, IdentityAggregator};
    use crate::source::{ReadStatus, ReaderFunc, VecSource};
    use crate::traits::GroupedRecord;
    use anyhow::anyhow;
    use cogroup_common::ShuffleConfigBuilder;
    use futures::StreamExt;

    fn session() -> Session {
        let config = ShuffleConfigBuilder::new()
            .num_partitions(3)
            .batch_size(4)
            .channel_capacity(2)
            .build()
            .unwrap();
        Session::new(config).unwrap()
    }

    fn sources(nshard: usize, nkey: u64) -> Vec<VecSource<String, u64>> {
        (0..nshard)
            .map(|shard| {
                let records = (0..nkey)
                    .rev()
                    .map(|k| (k.to_string(), (shard as u64) << 24 | k))
                    .collect();
                VecSource::new(shard, records)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_scan_state_machine() {
        let run = session().run(sources(2, 10)).unwrap();
        let mut scanner = run.scan(IdentityAggregator);
        assert_eq!(scanner.state(), ScanState::Ready);

        let mut seen = 0;
        while let Some(group) = scanner.advance().await {
            assert_eq!(scanner.state(), ScanState::Scanning);
            assert_eq!(group.len(), 2);
            seen += 1;
        }
        assert_eq!(seen, 10);
        assert_eq!(scanner.state(), ScanState::Exhausted);
        assert!(scanner.err().is_none());

        // Further calls keep reporting the end.
        assert!(scanner.advance().await.is_none());
        let summary = scanner.into_result().unwrap();
        assert_eq!(summary.groups, 10);
    }

    #[tokio::test]
    async fn test_transform_error_aborts_scan() {
        let run = session().run(sources(2, 10)).unwrap();
        let aggregator = FnAggregator::new(|key: String, values: Vec<u64>| {
            if key == "3" {
                Err(anyhow!("refusing key 3"))
            } else {
                Ok(GroupedRecord::new(key, values))
            }
        });
        let mut scanner = run.scan(aggregator);
        while scanner.advance().await.is_some() {}

        assert_eq!(scanner.state(), ScanState::Errored);
        match scanner.err() {
            Some(CogroupError::Transform { key, .. }) => assert_eq!(key, "\"3\""),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(scanner.into_result().is_err());
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_stalled_scan() {
        // A shard that never finishes and never produces anything.
        let stalled: ReaderFunc<(), String, u64> =
            ReaderFunc::new(2, |_, _, _, _| Ok(ReadStatus::Ready(0)));
        let session = session();
        let run = session.run(stalled.into_sources()).unwrap();
        let mut scanner = run.scan(IdentityAggregator);

        let token = session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            token.cancel();
        });

        assert!(scanner.advance().await.is_none());
        assert_eq!(scanner.state(), ScanState::Errored);
        assert!(scanner.err().is_some_and(|e| e.is_cancelled()));
    }

    #[tokio::test]
    async fn test_stream_adapter_yields_error_last() {
        let mut bad = sources(2, 4);
        bad.push(VecSource::new(2, vec![("0".to_string(), 2 << 24)]));
        let run = session().run(bad).unwrap();

        let items: Vec<_> = run.scan(IdentityAggregator).into_stream().collect().await;
        let (last, groups) = items.split_last().unwrap();
        assert!(groups.iter().all(|item| item.is_ok()));
        assert!(matches!(last, Err(CogroupError::IncompleteGroups { .. })));
    }

    #[tokio::test]
    async fn test_into_result_before_exhaustion() {
        let run = session().run(sources(1, 3)).unwrap();
        let scanner = run.scan(IdentityAggregator);
        assert!(matches!(
            scanner.into_result(),
            Err(CogroupError::Internal { .. })
        ));
    }
}
