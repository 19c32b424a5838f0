use bytes::Bytes;
use prost::Message as _;
use sluice_core::metric::{MetricKind, MetricPoint, MetricValue};
use snafu::ResultExt as _;

use super::{DecodeError, EncodeError, Encoder, InvalidPoint, Protobuf};

const CONTENT_TYPE: &str = "application/x-protobuf";

mod wire {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DataPointUploadMessage {
        #[prost(message, repeated, tag = "1")]
        pub datapoints: Vec<DataPoint>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DataPoint {
        #[prost(string, optional, tag = "1")]
        pub source: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub metric: Option<String>,
        #[prost(int64, optional, tag = "3")]
        pub timestamp: Option<i64>,
        #[prost(message, optional, tag = "4")]
        pub value: Option<Datum>,
        #[prost(enumeration = "MetricType", optional, tag = "5")]
        pub metric_type: Option<i32>,
        #[prost(message, repeated, tag = "6")]
        pub dimensions: Vec<Dimension>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Datum {
        #[prost(string, optional, tag = "1")]
        pub str_value: Option<String>,
        #[prost(double, optional, tag = "2")]
        pub double_value: Option<f64>,
        #[prost(int64, optional, tag = "3")]
        pub int_value: Option<i64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Dimension {
        #[prost(string, optional, tag = "1")]
        pub key: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub value: Option<String>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum MetricType {
        Gauge = 0,
        Counter = 1,
        Enum = 2,
        CumulativeCounter = 3,
    }
}

use self::wire::{DataPoint, DataPointUploadMessage, Datum, Dimension, MetricType};

/// Protocol Buffers encoder.
///
/// Produces an upload message holding one `DataPoint` record per point, in batch order. Points without a timestamp
/// are sent without one, leaving the ingest endpoint to assign the time of receipt.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtobufEncoder;

impl ProtobufEncoder {
    fn to_record(point: &MetricPoint) -> DataPoint {
        let value = match point.value() {
            MetricValue::Int(value) => Datum {
                int_value: Some(value),
                ..Default::default()
            },
            MetricValue::Float(value) => Datum {
                double_value: Some(value),
                ..Default::default()
            },
        };

        let metric_type = match point.kind() {
            MetricKind::Gauge => MetricType::Gauge,
            MetricKind::Counter => MetricType::Counter,
            MetricKind::CumulativeCounter => MetricType::CumulativeCounter,
        };

        DataPoint {
            source: point.source().map(str::to_string),
            metric: Some(point.name().to_string()),
            timestamp: (point.timestamp_ms() != 0).then_some(point.timestamp_ms()),
            value: Some(value),
            metric_type: Some(metric_type as i32),
            dimensions: point
                .dimensions()
                .iter()
                .map(|(key, value)| Dimension {
                    key: Some(key.clone()),
                    value: Some(value.clone()),
                })
                .collect(),
        }
    }

    fn from_record(record: DataPoint) -> Result<MetricPoint, DecodeError> {
        let metric = record.metric.unwrap_or_default();

        let value = match record.value {
            Some(Datum {
                int_value: Some(value), ..
            }) => MetricValue::Int(value),
            Some(Datum {
                double_value: Some(value),
                ..
            }) => MetricValue::Float(value),
            _ => return Err(DecodeError::MissingValue { metric }),
        };

        let raw_type = record.metric_type.unwrap_or(MetricType::Gauge as i32);
        let kind = match MetricType::try_from(raw_type) {
            Ok(MetricType::Gauge) => MetricKind::Gauge,
            Ok(MetricType::Counter) => MetricKind::Counter,
            Ok(MetricType::CumulativeCounter) => MetricKind::CumulativeCounter,
            Ok(MetricType::Enum) | Err(_) => {
                return Err(DecodeError::UnsupportedMetricType {
                    metric,
                    metric_type: raw_type,
                })
            }
        };

        MetricPoint::builder(metric, kind, value)
            .maybe_source(record.source)
            .dimensions(
                record
                    .dimensions
                    .into_iter()
                    .map(|d| (d.key.unwrap_or_default(), d.value.unwrap_or_default())),
            )
            .timestamp_ms(record.timestamp.unwrap_or(0))
            .allow_non_finite()
            .build()
            .context(InvalidPoint)
    }
}

impl Encoder for ProtobufEncoder {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    fn encode(&self, points: &[MetricPoint]) -> Result<Bytes, EncodeError> {
        let message = DataPointUploadMessage {
            datapoints: points.iter().map(Self::to_record).collect(),
        };
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<MetricPoint>, DecodeError> {
        let message = DataPointUploadMessage::decode(payload).context(Protobuf)?;
        message.datapoints.into_iter().map(Self::from_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_point() -> impl Strategy<Value = MetricPoint> {
        let kind = prop_oneof![
            Just(MetricKind::Gauge),
            Just(MetricKind::Counter),
            Just(MetricKind::CumulativeCounter),
        ];
        let value = prop_oneof![
            any::<i64>().prop_map(MetricValue::Int),
            any::<f64>()
                .prop_filter("NaN never compares equal", |v| !v.is_nan())
                .prop_map(MetricValue::Float),
        ];
        let dimensions = proptest::collection::btree_map("[a-z_]{1,8}", "[ -~]{0,12}", 0..4);
        let source = proptest::option::of("[a-z0-9.-]{1,16}");

        ("[a-z][a-z0-9._]{0,24}", kind, value, dimensions, source, 0i64..=2_000_000_000_000).prop_map(
            |(name, kind, value, dimensions, source, timestamp_ms)| {
                MetricPoint::builder(name, kind, value)
                    .maybe_source(source)
                    .dimensions(dimensions)
                    .timestamp_ms(timestamp_ms)
                    .allow_non_finite()
                    .build()
                    .unwrap()
            },
        )
    }

    proptest! {
        #[test]
        fn property_test_round_trip_preserves_batch(points in proptest::collection::vec(arb_point(), 0..32)) {
            let encoder = ProtobufEncoder;
            let payload = encoder.encode(&points).unwrap();
            let decoded = encoder.decode(&payload).unwrap();
            prop_assert_eq!(decoded, points);
        }
    }

    #[test]
    fn zero_timestamp_is_omitted() {
        let point = MetricPoint::builder("cpu", MetricKind::Gauge, 0.5).build().unwrap();
        let record = ProtobufEncoder::to_record(&point);
        assert_eq!(record.timestamp, None);
        assert_eq!(record.source, None);
        assert_eq!(record.value.and_then(|d| d.double_value), Some(0.5));
        assert_eq!(record.metric_type, Some(MetricType::Gauge as i32));
    }

    #[test]
    fn cumulative_counter_uses_wire_type_three() {
        let point = MetricPoint::builder("bytes", MetricKind::CumulativeCounter, 10_i64)
            .timestamp_ms(1_000)
            .build()
            .unwrap();
        let record = ProtobufEncoder::to_record(&point);
        assert_eq!(record.metric_type, Some(3));
        assert_eq!(record.timestamp, Some(1_000));
        assert_eq!(record.value.and_then(|d| d.int_value), Some(10));
    }

    #[test]
    fn enum_metric_type_is_not_decodable() {
        let message = DataPointUploadMessage {
            datapoints: vec![DataPoint {
                metric: Some("state".to_string()),
                value: Some(Datum {
                    int_value: Some(1),
                    ..Default::default()
                }),
                metric_type: Some(MetricType::Enum as i32),
                ..Default::default()
            }],
        };

        let result = ProtobufEncoder.decode(&message.encode_to_vec());
        assert!(matches!(
            result,
            Err(DecodeError::UnsupportedMetricType { metric_type: 2, .. })
        ));
    }

    #[test]
    fn string_value_is_not_decodable() {
        let message = DataPointUploadMessage {
            datapoints: vec![DataPoint {
                metric: Some("label".to_string()),
                value: Some(Datum {
                    str_value: Some("x".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        };

        let result = ProtobufEncoder.decode(&message.encode_to_vec());
        assert!(matches!(result, Err(DecodeError::MissingValue { .. })));
    }

    #[test]
    fn garbage_is_rejected() {
        let result = ProtobufEncoder.decode(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(DecodeError::Protobuf { .. })));
    }
}
