use std::{
    collections::HashMap,
    io::Read as _,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use http::StatusCode;
use sluice_core::{
    buffer::OverflowPolicy,
    metric::{
        histogram::{BucketCount, DeltaSnapshotTracker, HistogramSnapshot},
        MetricKind, MetricPoint, MetricValue,
    },
};
use sluice_io::{
    encoding::EncodingFormat,
    net::transport::{Transport, TransportError, TransportRequest, TransportResponse},
};
use sluice_sender::{CountingErrorHandler, MetricSender, OnSendErrorHandler};

#[derive(Default)]
struct RecordingTransport {
    batches: Mutex<Vec<Vec<MetricPoint>>>,
}

impl RecordingTransport {
    fn points(&self) -> Vec<MetricPoint> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        assert_eq!(request.headers["content-encoding"], "gzip");

        let mut payload = Vec::new();
        GzDecoder::new(&request.body[..]).read_to_end(&mut payload).unwrap();
        let points = EncodingFormat::Protobuf.encoder().decode(&payload).unwrap();
        self.batches.lock().unwrap().push(points);

        Ok(TransportResponse::new(StatusCode::OK, "\"OK\""))
    }
}

#[test]
fn concurrent_producers_lose_and_duplicate_nothing() {
    const PRODUCERS: usize = 8;
    const POINTS_PER_PRODUCER: i64 = 500;

    let transport = Arc::new(RecordingTransport::default());
    let errors = Arc::new(CountingErrorHandler::new());
    let sender = MetricSender::builder("web-1")
        .name("pipeline")
        .auth_token("secret")
        .max_buffer_size(256)
        .max_batch_size(50)
        .flush_interval(Duration::from_millis(10))
        .overflow_policy(OverflowPolicy::Block)
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .error_handler(Arc::clone(&errors) as Arc<dyn OnSendErrorHandler>)
        .build()
        .unwrap();
    sender.start().unwrap();

    thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let sender = &sender;
            scope.spawn(move || {
                let producer = producer.to_string();
                for i in 0..POINTS_PER_PRODUCER {
                    sender
                        .record_counter("events", i, &[("producer", producer.as_str())])
                        .unwrap();
                }
            });
        }
    });

    sender.stop(Duration::from_secs(10));

    let points = transport.points();
    assert_eq!(points.len(), PRODUCERS * POINTS_PER_PRODUCER as usize);
    assert!(transport.batches.lock().unwrap().iter().all(|batch| batch.len() <= 50));

    // Each producer's points arrive once each, in the order they were recorded.
    let mut by_producer: HashMap<String, Vec<i64>> = HashMap::new();
    for point in &points {
        let producer = point.dimensions()["producer"].clone();
        match point.value() {
            MetricValue::Int(i) => by_producer.entry(producer).or_default().push(i),
            other => panic!("unexpected value: {:?}", other),
        }
    }
    assert_eq!(by_producer.len(), PRODUCERS);
    for values in by_producer.values() {
        assert_eq!(*values, (0..POINTS_PER_PRODUCER).collect::<Vec<_>>());
    }

    let stats = sender.stats();
    assert_eq!(stats.points_enqueued, points.len() as u64);
    assert_eq!(stats.points_sent, points.len() as u64);
    assert_eq!(stats.points_rejected, 0);
    assert_eq!(stats.shutdown_points_lost, 0);
    assert_eq!(errors.total(), 0);
}

#[test]
fn sessions_commit_aggregated_points() {
    let transport = Arc::new(RecordingTransport::default());
    let sender = MetricSender::builder("web-1")
        .auth_token("secret")
        .flush_interval(Duration::from_millis(10))
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .build()
        .unwrap();
    sender.start().unwrap();

    let tracker = DeltaSnapshotTracker::delta();
    let snapshot = |count, total, max, low, high| HistogramSnapshot {
        count,
        total,
        max,
        buckets: vec![BucketCount::new(0.1, low), BucketCount::new(f64::INFINITY, high)],
    };

    {
        let mut session = sender.create_session();
        session.increment_counter("c", 1_i64, &[]).unwrap();
        session.increment_counter("c", 1_i64, &[]).unwrap();
        session.record_gauge_for_source("db-1", "load", 0.75, &[]).unwrap();
        session
            .record_distribution("latency", &tracker, snapshot(4, 1.0, 0.5, 1.0, 3.0), &[])
            .unwrap();
        session.close().unwrap();
    }
    {
        let mut session = sender.create_session();
        session
            .record_distribution("latency", &tracker, snapshot(6, 1.5, 0.4, 2.0, 4.0), &[])
            .unwrap();
    }

    sender.stop(Duration::from_secs(5));

    let points = transport.points();
    let find = |name: &str, source: &str| {
        points
            .iter()
            .filter(|p| p.name() == name && p.source() == Some(source))
            .collect::<Vec<_>>()
    };

    let counter = find("c", "web-1");
    assert_eq!(counter.len(), 1);
    assert_eq!(counter[0].kind(), MetricKind::Counter);
    assert_eq!(counter[0].value(), MetricValue::Int(2));

    assert_eq!(find("load", "db-1")[0].value(), MetricValue::Float(0.75));

    let counts = find("latency.count", "web-1")
        .iter()
        .map(|p| p.value())
        .collect::<Vec<_>>();
    assert_eq!(counts, vec![MetricValue::Int(4), MetricValue::Int(2)]);
    assert_eq!(find("latency.bucket", "web-1").len(), 4);

    // Points of one session share a single timestamp.
    let first_session = points
        .iter()
        .filter(|p| p.name() == "c" || p.name() == "load")
        .map(|p| p.timestamp_ms())
        .collect::<Vec<_>>();
    assert!(first_session.iter().all(|ts| *ts == first_session[0] && *ts > 0));
}
