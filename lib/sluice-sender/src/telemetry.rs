//! Sender telemetry.
use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};

use metrics::{counter, gauge, Counter, Gauge, Label};

/// A point-in-time view of a sender's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SenderStats {
    /// Points accepted into the buffer.
    pub points_enqueued: u64,

    /// Points rejected because the buffer was full or closed.
    pub points_rejected: u64,

    /// Points delivered and acknowledged.
    pub points_sent: u64,

    /// Points dropped because their batch could not be delivered.
    pub points_dropped: u64,

    /// Points still unsent when the shutdown deadline passed.
    pub shutdown_points_lost: u64,

    /// Batches delivered and acknowledged.
    pub batches_sent: u64,

    /// Batches that could not be delivered.
    pub batches_failed: u64,

    /// Request body bytes delivered, after compression.
    pub bytes_sent: u64,

    /// Points accepted but not yet delivered, dropped, or lost.
    pub points_pending: u64,
}

#[derive(Default)]
struct Totals {
    points_enqueued: AtomicU64,
    points_rejected: AtomicU64,
    points_sent: AtomicU64,
    points_dropped: AtomicU64,
    shutdown_points_lost: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Totals {
    fn pending(&self) -> u64 {
        // A batch can be tracked as sent before the producer that enqueued it is tracked as having done so.
        self.points_enqueued
            .load(Relaxed)
            .saturating_sub(self.points_sent.load(Relaxed))
            .saturating_sub(self.points_dropped.load(Relaxed))
            .saturating_sub(self.shutdown_points_lost.load(Relaxed))
    }
}

/// Telemetry for a single sender.
///
/// Every counter is emitted through the `metrics` facade, labeled with the sender name, and mirrored in local totals so
/// that [`SenderStats`] is available without a metrics recorder installed.
#[derive(Clone)]
pub(crate) struct SenderTelemetry {
    totals: Arc<Totals>,
    points_enqueued: Counter,
    points_rejected: Counter,
    points_sent: Counter,
    points_dropped: Counter,
    shutdown_points_lost: Counter,
    batches_sent: Counter,
    batches_failed: Counter,
    bytes_sent: Counter,
    points_pending: Gauge,
}

fn sender_labels(sender_name: &str) -> Vec<Label> {
    vec![Label::new("sender", sender_name.to_string())]
}

impl SenderTelemetry {
    pub fn new(sender_name: &str) -> Self {
        let labels = sender_labels(sender_name);
        Self {
            totals: Arc::new(Totals::default()),
            points_enqueued: counter!("sluice_points_enqueued_total", labels.clone()),
            points_rejected: counter!("sluice_points_rejected_total", labels.clone()),
            points_sent: counter!("sluice_points_sent_total", labels.clone()),
            points_dropped: counter!("sluice_points_dropped_total", labels.clone()),
            shutdown_points_lost: counter!("sluice_shutdown_points_lost_total", labels.clone()),
            batches_sent: counter!("sluice_batches_sent_total", labels.clone()),
            batches_failed: counter!("sluice_batches_failed_total", labels.clone()),
            bytes_sent: counter!("sluice_bytes_sent_total", labels.clone()),
            points_pending: gauge!("sluice_points_pending", labels),
        }
    }

    fn update_pending(&self) {
        self.points_pending.set(self.totals.pending() as f64);
    }

    /// Records that points were accepted by the buffer.
    pub fn track_enqueued(&self, points: usize) {
        self.totals.points_enqueued.fetch_add(points as u64, Relaxed);
        self.points_enqueued.increment(points as u64);
        self.update_pending();
    }

    pub fn track_rejected(&self, points: usize) {
        self.totals.points_rejected.fetch_add(points as u64, Relaxed);
        self.points_rejected.increment(points as u64);
    }

    pub fn track_batch_sent(&self, points: usize, bytes: usize) {
        self.totals.points_sent.fetch_add(points as u64, Relaxed);
        self.totals.batches_sent.fetch_add(1, Relaxed);
        self.totals.bytes_sent.fetch_add(bytes as u64, Relaxed);
        self.points_sent.increment(points as u64);
        self.batches_sent.increment(1);
        self.bytes_sent.increment(bytes as u64);
        self.update_pending();
    }

    pub fn track_batch_failed(&self, points: usize) {
        self.totals.points_dropped.fetch_add(points as u64, Relaxed);
        self.totals.batches_failed.fetch_add(1, Relaxed);
        self.points_dropped.increment(points as u64);
        self.batches_failed.increment(1);
        self.update_pending();
    }

    /// Records points that were still unsent when the sender stopped.
    pub fn track_lost(&self, points: usize) {
        self.totals.shutdown_points_lost.fetch_add(points as u64, Relaxed);
        self.shutdown_points_lost.increment(points as u64);
        self.update_pending();
    }

    /// Returns the number of points accepted but not yet sent, dropped, or lost.
    pub fn pending(&self) -> u64 {
        self.totals.pending()
    }

    pub fn snapshot(&self) -> SenderStats {
        let t = &self.totals;
        SenderStats {
            points_enqueued: t.points_enqueued.load(Relaxed),
            points_rejected: t.points_rejected.load(Relaxed),
            points_sent: t.points_sent.load(Relaxed),
            points_dropped: t.points_dropped.load(Relaxed),
            shutdown_points_lost: t.shutdown_points_lost.load(Relaxed),
            batches_sent: t.batches_sent.load(Relaxed),
            batches_failed: t.batches_failed.load(Relaxed),
            bytes_sent: t.bytes_sent.load(Relaxed),
            points_pending: t.pending(),
        }
    }
}
