//! Payload encoders.
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use sluice_core::metric::{MetricPoint, PointError};
use snafu::Snafu;

mod json;
pub use self::json::JsonEncoder;

mod protobuf;
pub use self::protobuf::ProtobufEncoder;

/// An error encoding a batch of points.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EncodeError {
    /// A point held a value that cannot be represented in the encoding.
    #[snafu(display("Metric '{}' has a non-finite value, which cannot be encoded.", metric))]
    NonFiniteValue {
        /// Name of the metric.
        metric: String,
    },

    /// The payload could not be serialized.
    #[snafu(display("Failed to serialize payload."))]
    Serialize {
        /// Error source.
        source: serde_json::Error,
    },
}

/// An error decoding a payload.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DecodeError {
    /// The payload was not a valid protobuf upload message.
    #[snafu(display("Failed to decode protobuf payload."))]
    Protobuf {
        /// Error source.
        source: prost::DecodeError,
    },

    /// The payload was not a valid JSON upload message.
    #[snafu(display("Failed to decode JSON payload."))]
    Json {
        /// Error source.
        source: serde_json::Error,
    },

    /// A record had no value, or a value of an unsupported type.
    #[snafu(display("Record for metric '{}' has no numeric value.", metric))]
    MissingValue {
        /// Name of the metric.
        metric: String,
    },

    /// A record had a metric type that has no corresponding kind.
    #[snafu(display("Record for metric '{}' has unsupported metric type {}.", metric, metric_type))]
    UnsupportedMetricType {
        /// Name of the metric.
        metric: String,

        /// Raw metric type.
        metric_type: i32,
    },

    /// A record described an invalid point.
    #[snafu(display("Record describes an invalid point."))]
    InvalidPoint {
        /// Error source.
        source: PointError,
    },
}

/// Encodes batches of points into request payloads.
///
/// Encoding is pure: the same batch always produces the same bytes.
pub trait Encoder: Send + Sync {
    /// Returns the value of the `Content-Type` header for payloads produced by this encoder.
    fn content_type(&self) -> &'static str;

    /// Encodes a batch of points.
    ///
    /// # Errors
    ///
    /// If any point cannot be represented in this encoding, an error is returned and nothing is encoded.
    fn encode(&self, points: &[MetricPoint]) -> Result<Bytes, EncodeError>;

    /// Decodes a payload back into points.
    ///
    /// # Errors
    ///
    /// If the payload is malformed, or describes an invalid point, an error is returned.
    fn decode(&self, payload: &[u8]) -> Result<Vec<MetricPoint>, DecodeError>;
}

/// Payload encoding.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EncodingFormat {
    /// Protocol Buffers.
    #[default]
    Protobuf,

    /// JSON, grouped by metric kind.
    Json,
}

impl EncodingFormat {
    /// Creates the encoder for this format.
    pub fn encoder(&self) -> Arc<dyn Encoder> {
        match self {
            Self::Protobuf => Arc::new(ProtobufEncoder),
            Self::Json => Arc::new(JsonEncoder),
        }
    }
}
