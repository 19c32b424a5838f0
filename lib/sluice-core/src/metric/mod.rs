//! Metric points.
use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub mod histogram;

/// Dimensions attached to a metric point, ordered by key.
pub type Dimensions = BTreeMap<String, String>;

/// An error constructing a metric point.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PointError {
    /// The metric name was empty.
    #[snafu(display("Metric name must not be empty."))]
    EmptyName,

    /// A dimension key was empty.
    #[snafu(display("Dimension keys must not be empty (metric '{}').", metric))]
    EmptyDimensionKey {
        /// Name of the metric.
        metric: String,
    },

    /// The same dimension key was given more than once.
    #[snafu(display("Dimension key '{}' was given more than once (metric '{}').", key, metric))]
    DuplicateDimensionKey {
        /// Name of the metric.
        metric: String,

        /// The repeated key.
        key: String,
    },

    /// The value was NaN or infinite.
    #[snafu(display("Metric '{}' has a non-finite value.", metric))]
    NonFiniteValue {
        /// Name of the metric.
        metric: String,
    },
}

/// Metric kind.
///
/// The kind tells the ingest endpoint how successive values of the same metric relate to each other.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// The latest value of a quantity.
    Gauge,

    /// An amount accumulated since the previous report.
    Counter,

    /// A monotonically increasing total since the source started.
    CumulativeCounter,
}

impl MetricKind {
    /// Returns the lowercase name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::CumulativeCounter => "cumulative_counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric metric value.
///
/// Integer and floating-point values are kept apart so that encoders can preserve the representation the producer
/// used.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// A signed integer value.
    Int(i64),

    /// A floating-point value.
    Float(f64),
}

impl MetricValue {
    /// Returns the value as a float, converting integers.
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(value) => *value as f64,
            Self::Float(value) => *value,
        }
    }

    /// Returns `true` if the value is an integer or a finite float.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(value) => value.is_finite(),
        }
    }

    /// Adds `other` to this value.
    ///
    /// Two integers sum as an integer, saturating at the bounds of `i64`. If either side is a float, the result is a
    /// float.
    pub fn accumulate(self, other: MetricValue) -> MetricValue {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Self::Int(a.saturating_add(b)),
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
        }
    }
}

/// A single metric measurement.
///
/// Points are immutable once built. A timestamp of zero means the ingest endpoint assigns the time on receipt.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricPoint {
    name: String,
    kind: MetricKind,
    value: MetricValue,
    source: Option<String>,
    dimensions: Dimensions,
    timestamp_ms: i64,
}

impl MetricPoint {
    /// Starts building a point with the given name, kind, and value.
    pub fn builder<N, V>(name: N, kind: MetricKind, value: V) -> MetricPointBuilder
    where
        N: Into<String>,
        V: Into<MetricValue>,
    {
        MetricPointBuilder {
            name: name.into(),
            kind,
            value: value.into(),
            source: None,
            dimensions: Vec::new(),
            timestamp_ms: 0,
            allow_non_finite: false,
        }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metric kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Returns the value.
    pub fn value(&self) -> MetricValue {
        self.value
    }

    /// Returns the source, if one was set.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Returns the dimensions.
    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    /// Returns the timestamp, in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// Builder for [`MetricPoint`].
#[derive(Clone, Debug)]
pub struct MetricPointBuilder {
    name: String,
    kind: MetricKind,
    value: MetricValue,
    source: Option<String>,
    dimensions: Vec<(String, String)>,
    timestamp_ms: i64,
    allow_non_finite: bool,
}

impl MetricPointBuilder {
    /// Sets the source.
    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the source, if one is given.
    pub fn maybe_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    /// Adds a single dimension.
    pub fn dimension<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.dimensions.push((key.into(), value.into()));
        self
    }

    /// Adds a set of dimensions.
    pub fn dimensions<I, K, V>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.dimensions
            .extend(dimensions.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the timestamp, in milliseconds since the Unix epoch.
    pub fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Accepts NaN and infinite values.
    ///
    /// Only encoders that can represent such values will deliver the point.
    pub fn allow_non_finite(mut self) -> Self {
        self.allow_non_finite = true;
        self
    }

    /// Validates and builds the point.
    ///
    /// # Errors
    ///
    /// If the name is empty, any dimension key is empty or repeated, or the value is NaN or infinite (unless
    /// [`allow_non_finite`][Self::allow_non_finite] was called), an error is returned.
    pub fn build(self) -> Result<MetricPoint, PointError> {
        if self.name.is_empty() {
            return Err(PointError::EmptyName);
        }
        if !self.allow_non_finite && !self.value.is_finite() {
            return Err(PointError::NonFiniteValue { metric: self.name });
        }

        let mut dimensions = Dimensions::new();
        for (key, value) in self.dimensions {
            if key.is_empty() {
                return Err(PointError::EmptyDimensionKey { metric: self.name });
            }
            if dimensions.contains_key(&key) {
                return Err(PointError::DuplicateDimensionKey { metric: self.name, key });
            }
            dimensions.insert(key, value);
        }

        Ok(MetricPoint {
            name: self.name,
            kind: self.kind,
            value: self.value,
            source: self.source,
            dimensions,
            timestamp_ms: self.timestamp_ms,
        })
    }
}
