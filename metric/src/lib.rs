//! A minimal metric abstraction decoupling recording from export.
//!
//! A [`Registry`] stores named [`Instrument`]s. The common case is
//! [`Metric<T>`] which maintains one observer of type `T` per unique set of
//! [`Attributes`], created on first use by [`Metric::recorder`]:
//!
//! ```
//! use metric::{Registry, Metric, U64Counter};
//!
//! let registry = Registry::new();
//! let requests: Metric<U64Counter> =
//!     registry.register_metric("requests", "number of requests received");
//!
//! // The recorder may be cached to amortise the attribute lookup.
//! let recorder = requests.recorder(&[("tenant", "t1")]);
//! recorder.inc(1);
//! ```
//!
//! Exporters drain the registry through the [`Reporter`] trait;
//! [`RawReporter`] buffers everything and is what tests assert against.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

mod counter;
mod duration;
mod gauge;
mod histogram;
mod metric;

pub use crate::metric::*;
pub use counter::*;
pub use duration::*;
pub use gauge::*;
pub use histogram::*;

/// A `Registry` stores a map of metric names to [`Instrument`]s.
#[derive(Debug, Default)]
pub struct Registry {
    /// Instruments indexed by metric name.
    ///
    /// A BTreeMap provides a consistent report ordering.
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new [`Metric`] with the provided name and description.
    ///
    /// `&'static str` is intentional: the metric name should appear in the
    /// plain so it can be grepped for.
    pub fn register_metric<T>(&self, name: &'static str, description: &'static str) -> Metric<T>
    where
        T: MetricObserver,
        T::Options: Default,
    {
        self.register_metric_with_options(name, description, Default::default)
    }

    /// Like [`Registry::register_metric`] but with explicit observer options,
    /// e.g. histogram buckets.
    ///
    /// If a metric with this `name` already exists it is returned and
    /// `options` is not invoked.
    pub fn register_metric_with_options<T: MetricObserver, F: FnOnce() -> T::Options>(
        &self,
        name: &'static str,
        description: &'static str,
        options: F,
    ) -> Metric<T> {
        self.register_instrument(name, move || Metric::new(name, description, options()))
    }

    /// Register (or fetch) a raw [`Instrument`] under `name`.
    ///
    /// # Panics
    ///
    /// Panics if an instrument is already registered under this name with a
    /// different type, or if the name is not `[0-9a-z_]+`.
    pub fn register_instrument<F: FnOnce() -> I, I: Instrument + Clone + 'static>(
        &self,
        name: &'static str,
        create: F,
    ) -> I {
        assert_legal_key(name);

        let mut instruments = self.instruments.lock();
        match instruments.entry(name) {
            Entry::Occupied(o) => match o.get().as_any().downcast_ref::<I>() {
                Some(instrument) => instrument.clone(),
                None => panic!("instrument {name} registered with two different types"),
            },
            Entry::Vacant(v) => {
                let instrument = create();
                v.insert(Box::new(instrument.clone()));
                instrument
            }
        }
    }

    /// Returns the already registered instrument, if any.
    ///
    /// Primarily useful for tests.
    pub fn get_instrument<I: Instrument + Clone + 'static>(&self, name: &'static str) -> Option<I> {
        let instruments = self.instruments.lock();
        instruments
            .get(name)
            .map(|instrument| match instrument.as_any().downcast_ref::<I>() {
                Some(metric) => metric.clone(),
                None => panic!("instrument {name} registered with two different types"),
            })
    }

    /// Record the current state of every registered metric to `reporter`,
    /// in alphabetical name order.
    pub fn report(&self, reporter: &mut dyn Reporter) {
        let instruments = self.instruments.lock();
        for instrument in instruments.values() {
            instrument.report(reporter)
        }
    }
}

/// A type that knows how to write its observations to a [`Reporter`].
pub trait Instrument: std::fmt::Debug + Send + Sync {
    /// Record the current state of this metric to `reporter`, calling
    /// `start_metric` once, `report_observation` per attribute set, and
    /// `finish_metric` once.
    fn report(&self, reporter: &mut dyn Reporter);

    /// Returns self as [`Any`] so callers can downcast to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// A sink for the state of all metrics within a [`Registry`].
pub trait Reporter {
    /// Start recording the observations of a single metric.
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    );

    /// Record one observation for the metric started by `start_metric`.
    fn report_observation(&mut self, attributes: &Attributes, observation: Observation);

    /// Finish the metric started by `start_metric`.
    fn finish_metric(&mut self);
}

/// All observations reported for a single metric.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    pub metric_name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub observations: Vec<(Attributes, Observation)>,
}

impl ObservationSet {
    /// Returns the observation for the given attributes, if any.
    pub fn observation(&self, attributes: impl Into<Attributes>) -> Option<&Observation> {
        let attributes = attributes.into();
        self.observations
            .iter()
            .find_map(|(a, o)| (a == &attributes).then_some(o))
    }
}

/// A [`Reporter`] that buffers the raw data it is given, for tests.
#[derive(Debug, Clone, Default)]
pub struct RawReporter {
    completed: Vec<ObservationSet>,
    in_progress: Option<ObservationSet>,
}

impl Reporter for RawReporter {
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    ) {
        assert!(self.in_progress.is_none(), "metric already in progress");
        self.in_progress = Some(ObservationSet {
            metric_name,
            description,
            kind,
            observations: Default::default(),
        })
    }

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation) {
        self.in_progress
            .as_mut()
            .expect("metric should be in progress")
            .observations
            .push((attributes.clone(), observation))
    }

    fn finish_metric(&mut self) {
        let metric = self
            .in_progress
            .take()
            .expect("metric should be in progress");
        self.completed.push(metric)
    }
}

impl RawReporter {
    /// Returns the [`ObservationSet`] for each reported metric.
    pub fn observations(&self) -> &Vec<ObservationSet> {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        &self.completed
    }

    /// Returns the observation set for the named metric, if any.
    pub fn metric(&self, metric_name: &str) -> Option<&ObservationSet> {
        self.observations()
            .iter()
            .find(|s| s.metric_name == metric_name)
    }
}

/// Identifies the type of [`Observation`] reported by a metric.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetricKind {
    U64Counter,
    U64Gauge,
    U64Histogram,
    DurationHistogram,
}

/// A point-in-time measurement taken from an observer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
    U64Histogram(HistogramObservation<u64>),
    DurationHistogram(HistogramObservation<std::time::Duration>),
}

/// A histogram measurement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HistogramObservation<T> {
    /// The sum of all recorded values.
    pub total: T,
    /// The buckets.
    pub buckets: Vec<ObservationBucket<T>>,
}

impl<T> HistogramObservation<T> {
    /// The total number of recorded values.
    pub fn sample_count(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }
}

/// A non-cumulative histogram bucket: the count of values `v` with
/// `prev.le < v <= le`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ObservationBucket<T> {
    pub le: T,
    pub count: u64,
}

/// A set of key-value pairs with unique keys.
///
/// A [`Metric`] records observations for each unique set of `Attributes`.
#[derive(Debug, Clone, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, &'static str, Cow<'static, str>> {
        self.0.iter()
    }

    /// Sets the value of the `key` attribute, replacing any existing value.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        assert_legal_key(key);
        self.0.insert(key, value.into());
    }

    /// Returns the value of the `key` attribute, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_ref())
    }
}

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(iterator: &'a [(&'static str, &'static str); N]) -> Self {
        Self(
            iterator
                .into_iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (*key, Cow::Borrowed(*value))
                })
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, String); N]> for Attributes {
    fn from(iterator: [(&'static str, String); N]) -> Self {
        Self(
            iterator
                .into_iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (key, Cow::Owned(value))
                })
                .collect(),
        )
    }
}

/// Panics unless the provided string matches `[0-9a-z_]+`.
pub fn assert_legal_key(s: &str) {
    assert!(!s.is_empty(), "string must not be empty");
    assert!(
        s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='z' | '_')),
        "string must be [0-9a-z_]+ got: \"{s}\""
    )
}
