//! Replication quorum tracking for in-flight pushes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use generated_types::{RawProfileSeries, RawSample};
use profile_types::ProfileSeries;
use tokio::sync::mpsc;

use crate::pool::RpcPushError;

/// Per-series replication state.
///
/// One tracker exists per outgoing series; every ingester task holding the
/// series reports its outcome here exactly once.
#[derive(Debug)]
pub(crate) struct SeriesTracker {
    pub(crate) series: ProfileSeries,
    pub(crate) min_success: usize,
    pub(crate) max_failures: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl SeriesTracker {
    pub(crate) fn new(series: ProfileSeries, min_success: usize, max_failures: usize) -> Self {
        Self {
            series,
            min_success,
            max_failures,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// The wire form of this series, sharing payload buffers.
    pub(crate) fn to_wire(&self) -> RawProfileSeries {
        RawProfileSeries {
            labels: self.series.labels.clone().into_inner(),
            samples: self
                .series
                .samples
                .iter()
                .map(|s| RawSample {
                    raw_profile: s.raw_profile.clone(),
                    id: s.id.clone(),
                })
                .collect(),
        }
    }
}

/// Per-request replication state.
///
/// `pending` counts series still short of their success quorum; `failed`
/// latches the first series to exceed its failure budget. The buffered
/// channels have capacity one and each is sent to at most once, guarded by
/// the atomic increments below, so completion never blocks on a caller that
/// already returned.
#[derive(Debug)]
pub(crate) struct PushTracker {
    pending: AtomicUsize,
    failed: AtomicUsize,
    done_tx: mpsc::Sender<()>,
    err_tx: mpsc::Sender<RpcPushError>,
}

impl PushTracker {
    /// A tracker for `series_count` series, plus the receivers the request
    /// waits on.
    pub(crate) fn new(
        series_count: usize,
    ) -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Receiver<RpcPushError>) {
        let (done_tx, done_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                pending: AtomicUsize::new(series_count),
                failed: AtomicUsize::new(0),
                done_tx,
                err_tx,
            }),
            done_rx,
            err_rx,
        )
    }

    /// Record one ingester's outcome for the series it carried.
    ///
    /// On success, a series reaching its quorum decrements the pending
    /// count; the task taking it to zero signals completion. On error, a
    /// series exceeding its failure budget fails the request; only the
    /// first such series publishes the error. The `fetch_add` guards
    /// guarantee a single task fires each terminal event.
    pub(crate) fn observe(
        &self,
        trackers: &[Arc<SeriesTracker>],
        result: &Result<(), RpcPushError>,
    ) {
        for tracker in trackers {
            match result {
                Err(err) => {
                    if tracker.failed.fetch_add(1, Ordering::Relaxed) + 1 <= tracker.max_failures {
                        continue;
                    }
                    if self.failed.fetch_add(1, Ordering::Relaxed) == 0 {
                        let _ = self.err_tx.try_send(err.clone());
                    }
                }
                Ok(()) => {
                    if tracker.succeeded.fetch_add(1, Ordering::Relaxed) + 1
                        != tracker.min_success
                    {
                        continue;
                    }
                    if self.pending.fetch_sub(1, Ordering::Relaxed) == 1 {
                        let _ = self.done_tx.try_send(());
                    }
                }
            }
        }
    }
}
