//! Cumulative histogram snapshots.
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

/// The count of samples at or below an upper bound.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketCount {
    /// Inclusive upper bound of the bucket.
    pub upper_bound: f64,

    /// Number of samples in the bucket.
    pub count: f64,
}

impl BucketCount {
    /// Creates a new `BucketCount`.
    pub const fn new(upper_bound: f64, count: f64) -> Self {
        Self { upper_bound, count }
    }
}

/// A summary of a distribution.
///
/// Snapshots read from a histogram are cumulative: every field covers all samples recorded since the histogram was
/// created.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramSnapshot {
    /// Number of samples.
    pub count: u64,

    /// Sum of all samples.
    pub total: f64,

    /// Largest sample.
    pub max: f64,

    /// Bucket counts, ordered by upper bound.
    pub buckets: Vec<BucketCount>,
}

impl HistogramSnapshot {
    fn buckets_aligned_with(&self, other: &HistogramSnapshot) -> bool {
        self.buckets.len() == other.buckets.len()
            && self
                .buckets
                .iter()
                .zip(other.buckets.iter())
                .all(|(a, b)| a.upper_bound == b.upper_bound)
    }
}

/// Turns cumulative histogram snapshots into the values that get reported.
///
/// In passthrough mode, snapshots are reported as-is. In delta mode, the tracker remembers the last snapshot it saw and
/// reports only what changed since then, which lets the values be sent as counters rather than cumulative counters.
///
/// A tracker is meant to be shared by every caller reporting the same histogram.
#[derive(Debug)]
pub struct DeltaSnapshotTracker {
    baseline: Option<ArcSwap<HistogramSnapshot>>,
}

impl DeltaSnapshotTracker {
    /// Creates a tracker that reports snapshots unchanged.
    pub fn passthrough() -> Self {
        Self { baseline: None }
    }

    /// Creates a tracker that reports the difference between consecutive snapshots.
    pub fn delta() -> Self {
        Self {
            baseline: Some(ArcSwap::from_pointee(HistogramSnapshot::default())),
        }
    }

    /// Returns `true` if this tracker reports deltas.
    pub fn is_delta(&self) -> bool {
        self.baseline.is_some()
    }

    /// Calculates the snapshot to report for `current`.
    ///
    /// In delta mode, `current` replaces the stored baseline in a single atomic swap, so concurrent callers each
    /// compute against one consistent previous snapshot.
    ///
    /// If `current` has a lower count than the baseline, the histogram is assumed to have been reset and `current` is
    /// reported unchanged. If the baseline has no buckets, or its bucket bounds differ from those of `current`, the
    /// buckets of `current` are reported unchanged.
    pub fn calculate_snapshot(&self, current: HistogramSnapshot) -> HistogramSnapshot {
        let baseline = match &self.baseline {
            Some(baseline) => baseline,
            None => return current,
        };

        let previous = baseline.swap(Arc::new(current.clone()));

        if current.count < previous.count {
            debug!(
                previous_count = previous.count,
                current_count = current.count,
                "Histogram count went backwards. Treating it as a reset."
            );
            return current;
        }

        let buckets = if previous.buckets.is_empty() {
            current.buckets
        } else if !current.buckets_aligned_with(&previous) {
            debug!(
                previous_buckets = previous.buckets.len(),
                current_buckets = current.buckets.len(),
                "Histogram bucket layout changed. Reporting current buckets unchanged."
            );
            current.buckets
        } else {
            current
                .buckets
                .iter()
                .zip(previous.buckets.iter())
                .map(|(cur, prev)| BucketCount::new(cur.upper_bound, cur.count - prev.count))
                .collect()
        };

        HistogramSnapshot {
            count: current.count - previous.count,
            total: current.total - previous.total,
            max: current.max,
            buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    use super::*;

    fn snapshot(count: u64, total: f64, max: f64, counts: &[f64]) -> HistogramSnapshot {
        let bounds = [1.0, 5.0, 10.0, 50.0];
        HistogramSnapshot {
            count,
            total,
            max,
            buckets: counts
                .iter()
                .zip(bounds.iter())
                .map(|(count, bound)| BucketCount::new(*bound, *count))
                .collect(),
        }
    }

    #[test]
    fn passthrough_returns_input() {
        let tracker = DeltaSnapshotTracker::passthrough();
        assert!(!tracker.is_delta());

        let s1 = snapshot(1, 2.0, 3.0, &[0.0, 1.0, 1.0]);
        let s2 = snapshot(3, 10.0, 5.5, &[0.0, 2.0, 3.0]);
        assert_eq!(tracker.calculate_snapshot(s1.clone()), s1);
        assert_eq!(tracker.calculate_snapshot(s2.clone()), s2);
    }

    #[test]
    fn first_delta_returns_input() {
        let tracker = DeltaSnapshotTracker::delta();
        assert!(tracker.is_delta());

        let s1 = snapshot(1, 2.0, 3.0, &[0.0, 1.0, 1.0]);
        assert_eq!(tracker.calculate_snapshot(s1.clone()), s1);
    }

    #[test]
    fn delta_between_consecutive_snapshots() {
        let tracker = DeltaSnapshotTracker::delta();
        tracker.calculate_snapshot(snapshot(1, 2.0, 3.0, &[0.0, 1.0, 1.0]));

        let emitted = tracker.calculate_snapshot(snapshot(3, 10.0, 5.5, &[0.0, 2.0, 3.0]));
        assert_eq!(emitted, snapshot(2, 8.0, 5.5, &[0.0, 1.0, 2.0]));

        // Nothing new recorded: everything but max is zero.
        let emitted = tracker.calculate_snapshot(snapshot(3, 10.0, 5.5, &[0.0, 2.0, 3.0]));
        assert_eq!(emitted, snapshot(0, 0.0, 5.5, &[0.0, 0.0, 0.0]));
    }

    #[test]
    fn reset_passes_current_through() {
        let tracker = DeltaSnapshotTracker::delta();
        tracker.calculate_snapshot(snapshot(10, 100.0, 20.0, &[1.0, 4.0, 5.0]));

        let after_reset = snapshot(2, 3.0, 2.0, &[1.0, 1.0, 0.0]);
        assert_eq!(tracker.calculate_snapshot(after_reset.clone()), after_reset);

        // The reset snapshot becomes the new baseline.
        let emitted = tracker.calculate_snapshot(snapshot(5, 9.0, 4.0, &[1.0, 3.0, 1.0]));
        assert_eq!(emitted, snapshot(3, 6.0, 4.0, &[0.0, 2.0, 1.0]));
    }

    #[test]
    fn misaligned_buckets_pass_through() {
        let tracker = DeltaSnapshotTracker::delta();
        tracker.calculate_snapshot(snapshot(1, 1.0, 1.0, &[1.0, 0.0]));

        let emitted = tracker.calculate_snapshot(snapshot(4, 7.0, 3.0, &[1.0, 2.0, 1.0]));
        assert_eq!(emitted, snapshot(3, 6.0, 3.0, &[1.0, 2.0, 1.0]));

        let tracker = DeltaSnapshotTracker::delta();
        tracker.calculate_snapshot(HistogramSnapshot {
            count: 1,
            total: 1.0,
            max: 1.0,
            buckets: vec![BucketCount::new(2.0, 1.0)],
        });
        let emitted = tracker.calculate_snapshot(snapshot(2, 3.0, 2.0, &[2.0]));
        assert_eq!(emitted.buckets, vec![BucketCount::new(1.0, 2.0)]);
    }

    #[test]
    fn concurrent_deltas_see_whole_baselines() {
        const THREADS: u64 = 8;

        let tracker = Arc::new(DeltaSnapshotTracker::delta());
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        // Equal counts never look like a reset, and each distinct total identifies the snapshot it came from.
        let handles = (1..=THREADS)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let emitted = tracker.calculate_snapshot(snapshot(5, i as f64, 1.0, &[]));
                    (i, emitted)
                })
            })
            .collect::<Vec<_>>();
        let results = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();

        let last = tracker.calculate_snapshot(snapshot(5, 0.0, 1.0, &[]));
        let last_total = (-last.total) as u64;
        assert!((1..=THREADS).contains(&last_total));

        // Swaps form a chain: each call saw the empty seed or exactly one other call's snapshot, and only the last
        // snapshot swapped in went unseen.
        let mut seen = results
            .iter()
            .map(|(i, emitted)| (*i as f64 - emitted.total) as u64)
            .collect::<Vec<_>>();
        seen.sort_unstable();
        let expected = (0..=THREADS).filter(|i| *i != last_total).collect::<Vec<_>>();
        assert_eq!(seen, expected);

        let emitted_count = results.iter().map(|(_, emitted)| emitted.count).sum::<u64>();
        assert_eq!(emitted_count, 5);
    }

    proptest! {
        #[test]
        fn property_test_deltas_sum_to_latest_cumulative(
            increments in prop::collection::vec((0..1_000u64, prop::array::uniform4(0..100u32)), 1..20)
        ) {
            let tracker = DeltaSnapshotTracker::delta();

            let mut cumulative = snapshot(0, 0.0, 0.0, &[0.0; 4]);
            let mut emitted_count = 0;
            let mut emitted_buckets = [0.0; 4];
            for (added, bucket_increments) in increments {
                cumulative.count += added;
                cumulative.total += added as f64;
                for (bucket, increment) in cumulative.buckets.iter_mut().zip(bucket_increments) {
                    bucket.count += f64::from(increment);
                }

                let emitted = tracker.calculate_snapshot(cumulative.clone());
                emitted_count += emitted.count;
                for (sum, bucket) in emitted_buckets.iter_mut().zip(&emitted.buckets) {
                    *sum += bucket.count;
                }
            }

            prop_assert_eq!(emitted_count, cumulative.count);
            for (sum, bucket) in emitted_buckets.iter().zip(&cumulative.buckets) {
                prop_assert_eq!(*sum, bucket.count);
            }
        }
    }
}
