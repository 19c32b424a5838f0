//! Bounded point buffer.
//!
//! The buffer is the hand-off point between any number of producing threads and the single background consumer that
//! batches points for delivery. Its capacity is fixed when it is created and is never exceeded: what happens when a
//! producer finds it full is decided by the [`OverflowPolicy`].
use serde::Deserialize;
use snafu::Snafu;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::metric::MetricPoint;

/// Behavior when a point is enqueued into a full buffer.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail immediately, dropping the point.
    #[default]
    Reject,

    /// Block the calling thread until space is available.
    ///
    /// Must not be used from within an asynchronous runtime.
    Block,
}

/// An error enqueueing points.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EnqueueError {
    /// The buffer was full.
    #[snafu(display("Buffer is full."))]
    Rejected,

    /// The buffer was closed by its consumer.
    #[snafu(display("Buffer is closed."))]
    Closed,

    /// The blocking overflow policy was used from within an asynchronous runtime.
    #[snafu(display("Blocking enqueue attempted from within an asynchronous runtime."))]
    BlockingInAsyncContext,

    /// A group of points was larger than the capacity of the buffer.
    #[snafu(display("Cannot enqueue {} points as a unit into a buffer with capacity {}.", len, capacity))]
    UnitTooLarge {
        /// Number of points in the group.
        len: usize,

        /// Capacity of the buffer.
        capacity: usize,
    },
}

impl<T> From<TrySendError<T>> for EnqueueError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => Self::Rejected,
            TrySendError::Closed(_) => Self::Closed,
        }
    }
}

/// Creates a bounded buffer with the given capacity and overflow policy.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded(capacity: usize, policy: OverflowPolicy) -> (PointBuffer, PointReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (PointBuffer { tx, policy }, PointReceiver { rx, peeked: None })
}

fn ensure_blocking_allowed() -> Result<(), EnqueueError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        Err(EnqueueError::BlockingInAsyncContext)
    } else {
        Ok(())
    }
}

/// Producer side of a point buffer.
///
/// Cheap to clone, and safe to use from any number of threads.
#[derive(Clone, Debug)]
pub struct PointBuffer {
    tx: mpsc::Sender<MetricPoint>,
    policy: OverflowPolicy,
}

impl PointBuffer {
    /// Returns the maximum number of points the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Returns the overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Returns `true` if the consumer has closed the buffer.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueues a single point.
    ///
    /// # Errors
    ///
    /// If the buffer is full and the policy is [`OverflowPolicy::Reject`], or the buffer is closed, an error is
    /// returned. If the policy is [`OverflowPolicy::Block`] and this is called from within an asynchronous runtime,
    /// an error is returned instead of blocking.
    pub fn enqueue(&self, point: MetricPoint) -> Result<(), EnqueueError> {
        match self.policy {
            OverflowPolicy::Reject => self.tx.try_send(point).map_err(Into::into),
            OverflowPolicy::Block => {
                ensure_blocking_allowed()?;
                self.tx.blocking_send(point).map_err(|_| EnqueueError::Closed)
            }
        }
    }

    /// Enqueues a group of points as a single unit.
    ///
    /// Either every point is enqueued, or none are. Points from the group are contiguous in the buffer, in the order
    /// given.
    ///
    /// # Errors
    ///
    /// If the group is larger than the capacity of the buffer, an error is returned. Otherwise, errors are returned
    /// under the same conditions as [`enqueue`][Self::enqueue].
    pub fn enqueue_all(&self, points: Vec<MetricPoint>) -> Result<(), EnqueueError> {
        if points.is_empty() {
            return Ok(());
        }

        let capacity = self.capacity();
        if points.len() > capacity {
            return Err(EnqueueError::UnitTooLarge {
                len: points.len(),
                capacity,
            });
        }

        let permits = match self.policy {
            OverflowPolicy::Reject => self.tx.try_reserve_many(points.len())?,
            OverflowPolicy::Block => {
                ensure_blocking_allowed()?;
                futures::executor::block_on(self.tx.reserve_many(points.len())).map_err(|_| EnqueueError::Closed)?
            }
        };

        for (permit, point) in permits.zip(points) {
            permit.send(point);
        }

        Ok(())
    }
}

/// Consumer side of a point buffer.
#[derive(Debug)]
pub struct PointReceiver {
    rx: mpsc::Receiver<MetricPoint>,
    peeked: Option<MetricPoint>,
}

impl PointReceiver {
    /// Returns the number of points currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len() + usize::from(self.peeked.is_some())
    }

    /// Returns `true` if no points are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes up to `limit` points from the buffer, in order, without waiting.
    pub fn drain_up_to(&mut self, limit: usize) -> Vec<MetricPoint> {
        let mut points = Vec::with_capacity(limit.min(self.len()));
        if limit == 0 {
            return points;
        }

        if let Some(point) = self.peeked.take() {
            points.push(point);
        }

        while points.len() < limit {
            match self.rx.try_recv() {
                Ok(point) => points.push(point),
                Err(_) => break,
            }
        }

        points
    }

    /// Waits until at least one point is buffered.
    ///
    /// Returns `false` if the buffer is closed and empty, or every producer has been dropped.
    pub async fn wait_until_non_empty(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }

        match self.rx.recv().await {
            Some(point) => {
                self.peeked = Some(point);
                true
            }
            None => false,
        }
    }

    /// Closes the buffer.
    ///
    /// Further enqueues fail with [`EnqueueError::Closed`]. Points already buffered can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Closes the buffer and discards every point left in it, returning how many there were.
    ///
    /// Enqueues that had already reserved space when the buffer closed are waited for, so every enqueue either failed
    /// with [`EnqueueError::Closed`] or is included in the returned count.
    pub fn close_and_discard(&mut self) -> usize {
        self.rx.close();

        let mut discarded = usize::from(self.peeked.take().is_some());
        while futures::executor::block_on(self.rx.recv()).is_some() {
            discarded += 1;
        }
        discarded
    }
}
