use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sluice_core::metric::{Dimensions, MetricKind, MetricPoint, MetricValue};
use snafu::ResultExt as _;

use super::{DecodeError, EncodeError, Encoder, InvalidPoint, Json, Serialize as SerializeError};

const CONTENT_TYPE: &str = "application/json";

#[derive(Default, Deserialize, Serialize)]
struct Payload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gauge: Vec<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    counter: Vec<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cumulative_counter: Vec<Record>,
}

#[derive(Deserialize, Serialize)]
struct Record {
    metric: String,
    value: Number,
    #[serde(default, skip_serializing_if = "Dimensions::is_empty")]
    dimensions: Dimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

// Integers are tried first, so whole numbers written without a fraction come back as integers.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum Number {
    Int(i64),
    Float(f64),
}

/// JSON encoder.
///
/// Points are grouped under `gauge`, `counter`, and `cumulative_counter` keys. The order of points is preserved within
/// each kind, but not across kinds.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEncoder;

impl JsonEncoder {
    fn to_record(point: &MetricPoint) -> Result<Record, EncodeError> {
        let value = match point.value() {
            MetricValue::Int(value) => Number::Int(value),
            MetricValue::Float(value) if value.is_finite() => Number::Float(value),
            MetricValue::Float(_) => {
                return Err(EncodeError::NonFiniteValue {
                    metric: point.name().to_string(),
                })
            }
        };

        Ok(Record {
            metric: point.name().to_string(),
            value,
            dimensions: point.dimensions().clone(),
            timestamp: (point.timestamp_ms() != 0).then_some(point.timestamp_ms()),
            source: point.source().map(str::to_string),
        })
    }

    fn from_record(kind: MetricKind, record: Record) -> Result<MetricPoint, DecodeError> {
        let value = match record.value {
            Number::Int(value) => MetricValue::Int(value),
            Number::Float(value) => MetricValue::Float(value),
        };

        MetricPoint::builder(record.metric, kind, value)
            .maybe_source(record.source)
            .dimensions(record.dimensions)
            .timestamp_ms(record.timestamp.unwrap_or(0))
            .build()
            .context(InvalidPoint)
    }
}

impl Encoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    fn encode(&self, points: &[MetricPoint]) -> Result<Bytes, EncodeError> {
        let mut payload = Payload::default();
        for point in points {
            let record = Self::to_record(point)?;
            match point.kind() {
                MetricKind::Gauge => payload.gauge.push(record),
                MetricKind::Counter => payload.counter.push(record),
                MetricKind::CumulativeCounter => payload.cumulative_counter.push(record),
            }
        }

        serde_json::to_vec(&payload).map(Bytes::from).context(SerializeError)
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<MetricPoint>, DecodeError> {
        let payload: Payload = serde_json::from_slice(payload).context(Json)?;

        let gauges = payload.gauge.into_iter().map(|r| (MetricKind::Gauge, r));
        let counters = payload.counter.into_iter().map(|r| (MetricKind::Counter, r));
        let cumulative = payload
            .cumulative_counter
            .into_iter()
            .map(|r| (MetricKind::CumulativeCounter, r));

        gauges
            .chain(counters)
            .chain(cumulative)
            .map(|(kind, record)| Self::from_record(kind, record))
            .collect()
    }
}
