use crate::{Attributes, Instrument, MetricKind, Observation, Reporter};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Types that can be created from an options value.
///
/// Observers that need no configuration use `Options = ()`.
pub trait MakeMetricObserver {
    type Options: Sized + Send + Sync + std::fmt::Debug;

    fn create(options: &Self::Options) -> Self;
}

/// An observer that records measurements for a single set of attributes.
pub trait MetricObserver:
    MakeMetricObserver + std::fmt::Debug + Clone + Send + Sync + 'static
{
    /// The type used to record values, e.g. a cheaply cloneable handle.
    type Recorder;

    /// The kind of observation this observer reports.
    fn kind() -> MetricKind;

    /// Returns a new recorder sharing this observer's state.
    fn recorder(&self) -> Self::Recorder;

    /// Returns the current state as an [`Observation`].
    fn observe(&self) -> Observation;
}

/// A `Metric` records one observation per unique set of [`Attributes`].
///
/// Observers are created lazily on first use of an attribute set and live for
/// the lifetime of the metric.
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    shared: Arc<MetricShared<T>>,
}

#[derive(Debug)]
struct MetricShared<T: MetricObserver> {
    options: T::Options,
    observers: Mutex<BTreeMap<Attributes, T>>,
}

impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    pub(crate) fn new(
        name: &'static str,
        description: &'static str,
        options: T::Options,
    ) -> Self {
        Self {
            name,
            description,
            shared: Arc::new(MetricShared {
                options,
                observers: Default::default(),
            }),
        }
    }

    /// Returns a recorder for the given attribute set, creating the backing
    /// observer if this is the first use of the attributes.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        self.observer(attributes).recorder()
    }

    /// Returns the observer for the given attribute set, creating it if
    /// necessary.
    pub fn observer(&self, attributes: impl Into<Attributes>) -> T {
        self.shared
            .observers
            .lock()
            .entry(attributes.into())
            .or_insert_with(|| T::create(&self.shared.options))
            .clone()
    }

    /// Returns the observer for the given attribute set only if it exists.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.shared.observers.lock().get(attributes).cloned()
    }
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn report(&self, reporter: &mut dyn Reporter) {
        reporter.start_metric(self.name, self.description, T::kind());
        for (attributes, observer) in self.shared.observers.lock().iter() {
            reporter.report_observation(attributes, observer.observe())
        }
        reporter.finish_metric();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
