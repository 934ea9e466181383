use crate::{
    HistogramObservation, MakeMetricObserver, MetricKind, MetricObserver, Observation,
    ObservationBucket,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Determines the bucketing used by a [`DurationHistogram`].
#[derive(Debug, Clone)]
pub struct DurationHistogramOptions {
    buckets: Vec<Duration>,
}

impl DurationHistogramOptions {
    /// Create options with the given bucket thresholds.
    pub fn new(thresholds: impl IntoIterator<Item = Duration>) -> Self {
        let mut buckets: Vec<_> = thresholds.into_iter().collect();
        buckets.sort_unstable();
        Self { buckets }
    }
}

impl Default for DurationHistogramOptions {
    fn default() -> Self {
        Self {
            buckets: vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(25),
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::MAX,
            ],
        }
    }
}

/// Bucketed observations of [`Duration`]s, e.g. request latencies.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    shared: Arc<Mutex<HistogramObservation<Duration>>>,
}

impl DurationHistogram {
    pub(crate) fn new(sorted_buckets: impl Iterator<Item = Duration>) -> Self {
        let buckets = sorted_buckets
            .map(|le| ObservationBucket {
                le,
                count: Default::default(),
            })
            .collect();

        Self {
            shared: Arc::new(Mutex::new(HistogramObservation {
                total: Duration::ZERO,
                buckets,
            })),
        }
    }

    /// Returns a snapshot of the current state.
    pub fn fetch(&self) -> HistogramObservation<Duration> {
        self.shared.lock().clone()
    }

    /// Records a single duration.
    pub fn record(&self, value: Duration) {
        let mut state = self.shared.lock();
        if let Some(bucket) = state.buckets.iter_mut().find(|bucket| value <= bucket.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.total = state.total.saturating_add(value);
        }
    }
}

impl MakeMetricObserver for DurationHistogram {
    type Options = DurationHistogramOptions;

    fn create(options: &DurationHistogramOptions) -> Self {
        Self::new(options.buckets.iter().cloned())
    }
}

impl MetricObserver for DurationHistogram {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::DurationHistogram
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::DurationHistogram(self.fetch())
    }
}
