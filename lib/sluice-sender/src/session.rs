use std::collections::BTreeMap;

use sluice_core::metric::{
    histogram::{DeltaSnapshotTracker, HistogramSnapshot},
    Dimensions, MetricKind, MetricPoint, MetricValue, PointError,
};
use snafu::ResultExt as _;
use tracing::warn;

use crate::{sender::now_ms, InvalidPoint, MetricSender, SenderError};

const UPPER_BOUND_DIMENSION: &str = "upper_bound";

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct SeriesKey {
    source: String,
    name: String,
    dimensions: Dimensions,
}

/// Aggregates points and commits them to the sender's buffer as a single unit.
///
/// Within a session, each series (source, metric name, and dimensions) holds a single value. Gauges and cumulative
/// counters keep the last value written. Counter increments are summed. Writing a series with a different kind than
/// before replaces it.
///
/// Nothing reaches the buffer until [`close`][Session::close] is called, or the session is dropped. All points are
/// timestamped at that moment.
pub struct Session<'a> {
    sender: &'a MetricSender,
    entries: BTreeMap<SeriesKey, (MetricKind, MetricValue)>,
    closed: bool,
}

impl<'a> Session<'a> {
    pub(crate) fn new(sender: &'a MetricSender) -> Self {
        Self {
            sender,
            entries: BTreeMap::new(),
            closed: false,
        }
    }

    /// Returns the number of distinct series recorded so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn put(
        &mut self, source: &str, name: &str, kind: MetricKind, value: MetricValue, dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError> {
        if self.closed {
            return Err(SenderError::SessionClosed);
        }

        let point = MetricPoint::builder(name, kind, value)
            .source(source)
            .dimensions(dimensions.iter().copied())
            .build()
            .context(InvalidPoint)?;

        let key = SeriesKey {
            source: source.to_string(),
            name: point.name().to_string(),
            dimensions: point.dimensions().clone(),
        };

        let value = match self.entries.get(&key) {
            Some((MetricKind::Counter, previous)) if kind == MetricKind::Counter => previous.accumulate(value),
            _ => value,
        };
        self.entries.insert(key, (kind, value));

        Ok(())
    }

    /// Records a gauge.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or the session is closed, an error is returned.
    pub fn record_gauge<V>(&mut self, name: &str, value: V, dimensions: &[(&str, &str)]) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        let sender = self.sender;
        let source = sender.default_source_name();
        self.put(source, name, MetricKind::Gauge, value.into(), dimensions)
    }

    /// Records a gauge for the given source.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or the session is closed, an error is returned.
    pub fn record_gauge_for_source<V>(
        &mut self, source: &str, name: &str, value: V, dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.put(source, name, MetricKind::Gauge, value.into(), dimensions)
    }

    /// Adds `delta` to a counter.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or the session is closed, an error is returned.
    pub fn increment_counter<V>(&mut self, name: &str, delta: V, dimensions: &[(&str, &str)]) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        let sender = self.sender;
        let source = sender.default_source_name();
        self.put(source, name, MetricKind::Counter, delta.into(), dimensions)
    }

    /// Adds `delta` to a counter for the given source.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or the session is closed, an error is returned.
    pub fn increment_counter_for_source<V>(
        &mut self, source: &str, name: &str, delta: V, dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.put(source, name, MetricKind::Counter, delta.into(), dimensions)
    }

    /// Sets a cumulative counter.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or the session is closed, an error is returned.
    pub fn set_cumulative_counter<V>(
        &mut self, name: &str, value: V, dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        let sender = self.sender;
        let source = sender.default_source_name();
        self.put(source, name, MetricKind::CumulativeCounter, value.into(), dimensions)
    }

    /// Sets a cumulative counter for the given source.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or the session is closed, an error is returned.
    pub fn set_cumulative_counter_for_source<V>(
        &mut self, source: &str, name: &str, value: V, dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.put(source, name, MetricKind::CumulativeCounter, value.into(), dimensions)
    }

    /// Records a histogram snapshot as a group of points.
    ///
    /// The snapshot goes through `tracker` first, so in delta mode only what changed since the tracker last saw this
    /// histogram is recorded. The points are:
    ///
    /// - `<name>.count`: number of samples
    /// - `<name>.sum`: sum of samples
    /// - `<name>.max`: largest sample, as a gauge
    /// - `<name>.bucket`: one per bucket, with an `upper_bound` dimension
    ///
    /// Count, sum, and bucket points are counters in delta mode, and cumulative counters otherwise.
    ///
    /// # Errors
    ///
    /// If the points are invalid, or the session is closed, an error is returned. The tracker has already taken the
    /// snapshot as its new baseline by then. A snapshot with a NaN or infinite total, max, or bucket count records
    /// nothing.
    pub fn record_distribution(
        &mut self, name: &str, tracker: &DeltaSnapshotTracker, snapshot: HistogramSnapshot,
        dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError> {
        if self.closed {
            return Err(SenderError::SessionClosed);
        }

        let kind = if tracker.is_delta() {
            MetricKind::Counter
        } else {
            MetricKind::CumulativeCounter
        };
        let emitted = tracker.calculate_snapshot(snapshot);
        let all_finite = emitted.total.is_finite()
            && emitted.max.is_finite()
            && emitted.buckets.iter().all(|bucket| bucket.count.is_finite());
        if !all_finite {
            return Err(SenderError::InvalidPoint {
                source: PointError::NonFiniteValue {
                    metric: name.to_string(),
                },
            });
        }

        let sender = self.sender;
        let source = sender.default_source_name();
        let count = MetricValue::Int(i64::try_from(emitted.count).unwrap_or(i64::MAX));

        self.put(source, &format!("{}.count", name), kind, count, dimensions)?;
        self.put(source, &format!("{}.sum", name), kind, emitted.total.into(), dimensions)?;
        self.put(source, &format!("{}.max", name), MetricKind::Gauge, emitted.max.into(), dimensions)?;

        let bucket_name = format!("{}.bucket", name);
        for bucket in &emitted.buckets {
            let upper_bound = format_upper_bound(bucket.upper_bound);
            let mut bucket_dimensions = dimensions.to_vec();
            bucket_dimensions.push((UPPER_BOUND_DIMENSION, upper_bound.as_str()));
            self.put(source, &bucket_name, kind, bucket.count.into(), &bucket_dimensions)?;
        }

        Ok(())
    }

    /// Commits every recorded point to the sender's buffer as a single unit.
    ///
    /// Points are timestamped with the current time. Closing an already closed session does nothing.
    ///
    /// # Errors
    ///
    /// If the points cannot be buffered, an error is returned, and none of them are.
    pub fn close(&mut self) -> Result<(), SenderError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let timestamp_ms = now_ms();
        let points = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(key, (kind, value))| {
                MetricPoint::builder(key.name, kind, value)
                    .source(key.source)
                    .dimensions(key.dimensions)
                    .timestamp_ms(timestamp_ms)
                    .build()
                    .context(InvalidPoint)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.sender.submit_all(points)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to commit session on drop.");
        }
    }
}

fn format_upper_bound(upper_bound: f64) -> String {
    if upper_bound.is_infinite() && upper_bound > 0.0 {
        "+Inf".to_string()
    } else {
        upper_bound.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use similar_asserts::assert_eq;
    use sluice_core::metric::histogram::BucketCount;

    use super::*;
    use crate::{config::SenderConfiguration, MetricSenderBuilder};

    fn sender() -> MetricSender {
        let mut config = SenderConfiguration::new("web-1");
        config.max_buffer_size = 8;
        config.max_batch_size = 8;
        MetricSenderBuilder::with_configuration(config)
            .auth_token("secret")
            .transport(Arc::new(NeverCalled))
            .build()
            .unwrap()
    }

    struct NeverCalled;

    #[async_trait::async_trait]
    impl sluice_io::net::transport::Transport for NeverCalled {
        async fn send(
            &self, _: sluice_io::net::transport::TransportRequest,
        ) -> Result<sluice_io::net::transport::TransportResponse, sluice_io::net::transport::TransportError> {
            unreachable!("sessions are tested without starting the sender")
        }
    }

    #[test]
    fn counter_increments_sum() {
        let sender = sender();
        let mut session = sender.create_session();
        session.increment_counter("c", 1_i64, &[]).unwrap();
        session.increment_counter("c", 1_i64, &[]).unwrap();
        assert_eq!(session.len(), 1);

        let (_, (kind, value)) = session.entries.iter().next().unwrap();
        assert_eq!(*kind, MetricKind::Counter);
        assert_eq!(*value, MetricValue::Int(2));

        session.increment_counter("c", 0.5, &[]).unwrap();
        let (_, (_, value)) = session.entries.iter().next().unwrap();
        assert_eq!(*value, MetricValue::Float(2.5));

        session.close().unwrap();
        assert_eq!(sender.stats().points_enqueued, 1);
    }

    #[test]
    fn gauges_keep_last_value_and_kinds_replace() {
        let sender = sender();
        let mut session = sender.create_session();
        session.record_gauge("g", 1_i64, &[("host", "a")]).unwrap();
        session.record_gauge("g", 7_i64, &[("host", "a")]).unwrap();
        session.record_gauge("g", 3_i64, &[("host", "b")]).unwrap();
        assert_eq!(session.len(), 2);

        session.increment_counter("g", 5_i64, &[("host", "a")]).unwrap();
        session.increment_counter("g", 5_i64, &[("host", "a")]).unwrap();
        let values = session.entries.values().cloned().collect::<Vec<_>>();
        assert_eq!(
            values,
            vec![
                (MetricKind::Counter, MetricValue::Int(10)),
                (MetricKind::Gauge, MetricValue::Int(3))
            ]
        );
    }

    #[test]
    fn sources_are_separate_series() {
        let sender = sender();
        let mut session = sender.create_session();
        session.set_cumulative_counter("bytes", 1_i64, &[]).unwrap();
        session.set_cumulative_counter_for_source("db-1", "bytes", 2_i64, &[]).unwrap();
        session.increment_counter_for_source("db-1", "queries", 1_i64, &[]).unwrap();
        session.record_gauge_for_source("db-1", "load", 0.3, &[]).unwrap();
        assert_eq!(session.len(), 4);

        let sources = session.entries.keys().map(|k| k.source.as_str()).collect::<Vec<_>>();
        assert_eq!(sources, vec!["db-1", "db-1", "db-1", "web-1"]);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let sender = sender();
        let mut session = sender.create_session();
        session.record_gauge("g", 1_i64, &[]).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(sender.stats().points_enqueued, 1);

        assert!(matches!(
            session.record_gauge("g", 1_i64, &[]),
            Err(SenderError::SessionClosed)
        ));
    }

    #[test]
    fn drop_commits() {
        let sender = sender();
        {
            let mut session = sender.create_session();
            session.record_gauge("g", 1_i64, &[]).unwrap();
            session.record_gauge("h", 1_i64, &[]).unwrap();
        }
        assert_eq!(sender.stats().points_enqueued, 2);
    }

    #[test]
    fn oversized_session_is_rejected_as_a_unit() {
        let sender = sender();
        let mut session = sender.create_session();
        for i in 0..9 {
            session.record_gauge(&format!("g{}", i), 1_i64, &[]).unwrap();
        }

        assert!(matches!(session.close(), Err(SenderError::Enqueue { points: 9, .. })));
        let stats = sender.stats();
        assert_eq!(stats.points_enqueued, 0);
        assert_eq!(stats.points_rejected, 9);
    }

    #[test]
    fn invalid_points_are_rejected_at_record_time() {
        let sender = sender();
        let mut session = sender.create_session();
        assert!(matches!(
            session.record_gauge("g", 1_i64, &[("", "x")]),
            Err(SenderError::InvalidPoint { .. })
        ));
        assert!(session.is_empty());
    }

    #[test]
    fn non_finite_values_are_rejected_at_record_time() {
        let sender = sender();
        let mut session = sender.create_session();
        session.record_gauge("g", 1_i64, &[]).unwrap();

        assert!(matches!(
            session.record_gauge("ratio", f64::NAN, &[]),
            Err(SenderError::InvalidPoint {
                source: PointError::NonFiniteValue { .. }
            })
        ));

        let tracker = DeltaSnapshotTracker::passthrough();
        let infinite_total = snapshot(3, f64::INFINITY, 5.5, [0.0, 2.0, 3.0]);
        let result = session.record_distribution("latency", &tracker, infinite_total, &[]);
        assert!(matches!(result, Err(SenderError::InvalidPoint { .. })));

        // Nothing from the rejected distribution was recorded.
        assert_eq!(session.len(), 1);
        session.close().unwrap();
        assert_eq!(sender.stats().points_enqueued, 1);
    }

    fn snapshot(count: u64, total: f64, max: f64, buckets: [f64; 3]) -> HistogramSnapshot {
        HistogramSnapshot {
            count,
            total,
            max,
            buckets: vec![
                BucketCount::new(1.0, buckets[0]),
                BucketCount::new(10.0, buckets[1]),
                BucketCount::new(f64::INFINITY, buckets[2]),
            ],
        }
    }

    #[test]
    fn delta_distribution_points() {
        let sender = sender();
        let tracker = DeltaSnapshotTracker::delta();
        tracker.calculate_snapshot(snapshot(1, 2.0, 3.0, [0.0, 1.0, 1.0]));

        let mut session = sender.create_session();
        session
            .record_distribution("latency", &tracker, snapshot(3, 10.0, 5.5, [0.0, 2.0, 3.0]), &[("op", "get")])
            .unwrap();

        let series = session
            .entries
            .iter()
            .map(|(key, (kind, value))| {
                let bound = key.dimensions.get(UPPER_BOUND_DIMENSION).cloned();
                (key.name.clone(), bound, *kind, *value)
            })
            .collect::<Vec<_>>();

        assert_eq!(
            series,
            vec![
                ("latency.bucket".to_string(), Some("+Inf".to_string()), MetricKind::Counter, MetricValue::Float(2.0)),
                ("latency.bucket".to_string(), Some("1".to_string()), MetricKind::Counter, MetricValue::Float(0.0)),
                ("latency.bucket".to_string(), Some("10".to_string()), MetricKind::Counter, MetricValue::Float(1.0)),
                ("latency.count".to_string(), None, MetricKind::Counter, MetricValue::Int(2)),
                ("latency.max".to_string(), None, MetricKind::Gauge, MetricValue::Float(5.5)),
                ("latency.sum".to_string(), None, MetricKind::Counter, MetricValue::Float(8.0)),
            ]
        );
        assert!(session
            .entries
            .keys()
            .all(|key| key.dimensions.get("op").map(String::as_str) == Some("get")));
    }

    #[test]
    fn passthrough_distribution_is_cumulative() {
        let sender = sender();
        let tracker = DeltaSnapshotTracker::passthrough();
        let mut session = sender.create_session();
        session
            .record_distribution("latency", &tracker, snapshot(3, 10.0, 5.5, [0.0, 2.0, 3.0]), &[])
            .unwrap();

        let count = session
            .entries
            .iter()
            .find(|(key, _)| key.name == "latency.count")
            .map(|(_, entry)| *entry);
        assert_eq!(count, Some((MetricKind::CumulativeCounter, MetricValue::Int(3))));
        session.close().unwrap();
        sender.stop(Duration::from_millis(10));
    }
}
