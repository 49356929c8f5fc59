use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub type Timestamp = i64;

/// Label is a key/value pair of strings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:?}", self.name, self.value)
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        // NaN payloads (staleness markers) compare equal to each other
        self.timestamp == other.timestamp && self.value.to_bits() == other.value.to_bits()
    }
}

impl Eq for Sample {}

impl PartialOrd for Sample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sample {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

/// A series as produced by the ingestion decoders and as handed to the sink:
/// metric name, label set and an ordered run of samples.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub metric_name: String,
    pub labels: Vec<Label>,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new<S: Into<String>>(metric_name: S, labels: Vec<Label>, samples: Vec<Sample>) -> Self {
        Self {
            metric_name: metric_name.into(),
            labels,
            samples,
        }
    }

    pub fn with_sample<S: Into<String>>(metric_name: S, labels: Vec<Label>, timestamp: Timestamp, value: f64) -> Self {
        Self::new(metric_name, labels, vec![Sample::new(timestamp, value)])
    }
}

/// Prometheus exposition style: `name{a="b",c="d"}`. Samples are not included.
impl Display for TimeSeries {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.metric_name)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", label)?;
        }
        write!(f, "}}")
    }
}
