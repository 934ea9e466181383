use crate::{
    HistogramObservation, MakeMetricObserver, MetricKind, MetricObserver, Observation,
    ObservationBucket,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Determines the bucketing used by a [`U64Histogram`].
#[derive(Debug, Clone)]
pub struct U64HistogramOptions {
    buckets: Vec<u64>,
}

impl U64HistogramOptions {
    /// Create options with the given bucket thresholds.
    pub fn new(thresholds: impl IntoIterator<Item = u64>) -> Self {
        let mut buckets: Vec<_> = thresholds.into_iter().collect();
        buckets.sort_unstable();
        Self { buckets }
    }
}

/// Bucketed observations of `u64` values.
///
/// Values exceeding the largest bucket threshold are dropped; include a
/// `u64::MAX` bucket when that matters.
#[derive(Debug, Clone)]
pub struct U64Histogram {
    shared: Arc<Mutex<HistogramObservation<u64>>>,
}

impl U64Histogram {
    pub(crate) fn new(sorted_buckets: impl Iterator<Item = u64>) -> Self {
        let buckets = sorted_buckets
            .map(|le| ObservationBucket {
                le,
                count: Default::default(),
            })
            .collect();

        Self {
            shared: Arc::new(Mutex::new(HistogramObservation {
                total: Default::default(),
                buckets,
            })),
        }
    }

    /// Returns a snapshot of the current state.
    pub fn fetch(&self) -> HistogramObservation<u64> {
        self.shared.lock().clone()
    }

    /// Records a single value.
    pub fn record(&self, value: u64) {
        let mut state = self.shared.lock();
        if let Some(bucket) = state.buckets.iter_mut().find(|bucket| value <= bucket.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.total = state.total.wrapping_add(value);
        }
    }
}

impl MakeMetricObserver for U64Histogram {
    type Options = U64HistogramOptions;

    fn create(options: &U64HistogramOptions) -> Self {
        Self::new(options.buckets.iter().cloned())
    }
}

impl MetricObserver for U64Histogram {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Histogram
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Histogram(self.fetch())
    }
}
