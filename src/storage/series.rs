use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Opaque identifier assigned by the catalog to one stored series.
pub type SeriesId = u64;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A single (timestamp, value) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Timestamp in nanoseconds since epoch
    pub timestamp: Timestamp,
    /// The measured value
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// An ordered label-name to value map identifying one series within a metric.
///
/// Iteration order is the sorted label name order, so grouping keys and
/// rendered output are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insertion, used when registering series.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.as_str())
    }

    /// Value of a label, treating a missing label as the empty string.
    pub fn value_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Keeps only the named labels. An empty name list yields empty labels.
    pub fn project(&self, keep: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|(k, _)| keep.iter().any(|n| n == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Drops the named labels, keeping the rest.
    pub fn without(&self, drop: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|(k, _)| !drop.iter().any(|n| n == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", name, value)?;
        }
        write!(f, "}}")
    }
}

/// One output series as it flows between executor operators and out to the
/// caller: the identifier (absent for derived series), its label set, and
/// its time-ordered samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesFrame {
    /// Storage identifier; None for series computed by the query itself
    pub id: Option<SeriesId>,
    /// The series label set
    pub labels: Labels,
    /// Samples in ascending timestamp order
    pub samples: Vec<Sample>,
}

impl SeriesFrame {
    pub fn new(id: Option<SeriesId>, labels: Labels) -> Self {
        Self {
            id,
            labels,
            samples: Vec::new(),
        }
    }

    pub fn with_samples(id: Option<SeriesId>, labels: Labels, samples: Vec<Sample>) -> Self {
        Self { id, labels, samples }
    }

    /// Value of the final sample, used as the ordering key for sorted output.
    pub fn last_value(&self) -> Option<f64> {
        self.samples.last().map(|s| s.value)
    }
}
