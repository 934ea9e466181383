use crate::{MakeMetricObserver, MetricKind, MetricObserver, Observation};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic counter of `u64` values.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increments the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Fetches the current count.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MakeMetricObserver for U64Counter {
    type Options = ();

    fn create(_: &()) -> Self {
        Self::default()
    }
}

impl MetricObserver for U64Counter {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Counter
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Counter(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = U64Counter::default();
        assert_eq!(counter.observe(), Observation::U64Counter(0));

        counter.inc(12);
        counter.inc(0);
        counter.inc(30);
        assert_eq!(counter.observe(), Observation::U64Counter(42));

        // Recorders share state with their parent.
        let r = counter.recorder();
        r.inc(1);
        drop(r);
        assert_eq!(counter.fetch(), 43);
    }
}
