//! An ordered set of series labels.

use std::fmt;
use std::ops::Deref;

use generated_types::LabelPair;

/// A set of series labels.
///
/// Canonical form is sorted ascending by name with unique names; most
/// constructors establish it via [`Labels::sort`] / [`Labels::dedup_by_name`]
/// and the pipeline re-establishes it after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels(Vec<LabelPair>);

impl Labels {
    /// Build labels from (name, value) pairs, sorting them into canonical
    /// order.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut labels = Self(
            pairs
                .into_iter()
                .map(|(name, value)| LabelPair {
                    name: name.to_owned(),
                    value: value.to_owned(),
                })
                .collect(),
        );
        labels.sort();
        labels
    }

    /// The value of the label `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Returns true if a label named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a label. The caller re-sorts afterwards if canonical order
    /// matters.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(LabelPair {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace the value of the label `name`, or append it if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        match self.0.iter_mut().find(|l| l.name == name) {
            Some(l) => l.value = value.into(),
            None => self.push(name, value),
        }
    }

    /// Remove every label named `name`.
    pub fn delete(&mut self, name: &str) {
        self.0.retain(|l| l.name != name);
    }

    /// Sort labels ascending by name, preserving the relative order of
    /// duplicates.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Drop duplicate names, keeping the first occurrence of each.
    ///
    /// Requires sorted labels.
    pub fn dedup_by_name(&mut self) {
        self.0.dedup_by(|b, a| a.name == b.name);
    }

    pub fn into_inner(self) -> Vec<LabelPair> {
        self.0
    }
}

impl Deref for Labels {
    type Target = [LabelPair];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<LabelPair>> for Labels {
    fn from(pairs: Vec<LabelPair>) -> Self {
        Self(pairs)
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a LabelPair;
    type IntoIter = std::slice::Iter<'a, LabelPair>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Renders the canonical `{name="value", other="value"}` form that series
/// tokens are derived from.
impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", l.name, l.value)?;
        }
        write!(f, "}}")
    }
}
