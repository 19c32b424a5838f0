use std::{sync::Arc, time::Duration};

use sluice_core::{buffer::PointReceiver, metric::MetricPoint};
use sluice_io::{encoding::Encoder, net::IngestClient};
use tokio::{
    select,
    sync::oneshot,
    time::{interval_at, timeout_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    auth::AuthTokenProvider,
    handler::{ErrorHandlers, MetricError, MetricErrorKind},
    telemetry::SenderTelemetry,
};

/// Drains the buffer into bounded batches and delivers them, one at a time.
pub(crate) struct Batcher {
    pub receiver: PointReceiver,
    pub encoder: Arc<dyn Encoder>,
    pub client: IngestClient,
    pub auth: Arc<dyn AuthTokenProvider>,
    pub handlers: ErrorHandlers,
    pub telemetry: SenderTelemetry,
    pub max_batch_size: usize,
    pub flush_interval: Duration,

    /// Size of the batch being sent, if any.
    pub in_flight: usize,
}

impl Batcher {
    async fn run(&mut self, shutdown: CancellationToken) {
        let mut flush = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            endpoint = self.client.url(),
            max_batch_size = self.max_batch_size,
            flush_interval = ?self.flush_interval,
            "Batcher started."
        );

        loop {
            // Idle until something is buffered, then wait for the next flush.
            select! {
                _ = shutdown.cancelled() => break,
                has_points = self.receiver.wait_until_non_empty() => {
                    if !has_points {
                        debug!("Every producer is gone. Stopping.");
                        break;
                    }

                    select! {
                        _ = shutdown.cancelled() => break,
                        _ = flush.tick() => self.flush_available().await,
                    }
                }
            }
        }

        self.receiver.close();

        let remaining = self.receiver.len();
        debug!(remaining, "Stopping. Sending remaining points.");
        while self.receiver.wait_until_non_empty().await {
            let batch = self.receiver.drain_up_to(self.max_batch_size);
            self.send_batch(batch).await;
        }

        debug!("Batcher stopped.");
    }

    /// Sends everything buffered when the flush began, in batches of at most `max_batch_size` points.
    ///
    /// Points arriving during the flush wait for the next one, so a busy producer cannot hold the batcher in a single
    /// flush indefinitely.
    async fn flush_available(&mut self) {
        let mut remaining = self.receiver.len();
        while remaining > 0 {
            let batch = self.receiver.drain_up_to(self.max_batch_size.min(remaining));
            if batch.is_empty() {
                break;
            }

            remaining -= batch.len();
            self.send_batch(batch).await;
        }
    }

    async fn send_batch(&mut self, batch: Vec<MetricPoint>) {
        self.in_flight = batch.len();
        self.deliver(batch).await;
        self.in_flight = 0;
    }

    async fn deliver(&self, batch: Vec<MetricPoint>) {
        let batch_size = batch.len();

        let token = match self.auth.auth_token() {
            Ok(token) => token,
            Err(e) => {
                error!(batch_size, error = %e, "Failed to obtain authentication token. Dropping batch.");
                self.fail(MetricError::new(MetricErrorKind::AuthToken, e.to_string(), batch_size).with_cause(e));
                return;
            }
        };

        let payload = match self.encoder.encode(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!(batch_size, error = %e, "Failed to encode batch. Dropping batch.");
                self.fail(
                    MetricError::new(MetricErrorKind::Encode, "Failed to encode batch.", batch_size).with_cause(e),
                );
                return;
            }
        };

        match self.client.deliver(&token, self.encoder.content_type(), payload).await {
            Ok(delivery) => {
                debug!(
                    batch_size,
                    attempts = delivery.attempts,
                    bytes_sent = delivery.bytes_sent,
                    "Sent batch."
                );
                self.telemetry.track_batch_sent(batch_size, delivery.bytes_sent);
            }
            Err(e) => {
                error!(batch_size, attempts = e.attempts(), error = %e, "Failed to send batch. Dropping batch.");
                self.fail(MetricError::new(MetricErrorKind::DatapointSend, e.to_string(), batch_size).with_cause(e));
            }
        }
    }

    fn fail(&self, error: MetricError) {
        self.telemetry.track_batch_failed(error.points());
        self.handlers.report(error);
    }

    /// Closes the buffer and reports every point not yet sent as shutdown data loss.
    ///
    /// That is whatever is still buffered, plus the batch whose send was abandoned.
    pub fn discard_unsent(mut self) {
        let lost = self.in_flight + self.receiver.close_and_discard();
        if lost == 0 {
            return;
        }

        warn!(points = lost, "Points were not sent before shutdown.");
        self.telemetry.track_lost(lost);
        self.handlers.report(MetricError::new(
            MetricErrorKind::ShutdownDataLoss,
            "Points were not sent before the shutdown deadline.",
            lost,
        ));
    }
}

/// Runs the batcher until a stop deadline arrives on `stop_rx`, then gives it until that deadline to send what is left.
///
/// Whatever is still unsent at the deadline is abandoned and reported as shutdown data loss.
pub(crate) async fn supervise(mut batcher: Batcher, stop_rx: oneshot::Receiver<Instant>) {
    let shutdown = CancellationToken::new();

    {
        let mut work = Box::pin(batcher.run(shutdown.child_token()));

        let deadline = select! {
            _ = &mut work => None,
            deadline = stop_rx => Some(deadline.unwrap_or_else(|_| Instant::now())),
        };

        if let Some(deadline) = deadline {
            shutdown.cancel();
            if timeout_at(deadline, &mut work).await.is_err() {
                warn!("Shutdown deadline passed before every point was sent. Abandoning in-flight send.");
            }
        }
    }

    batcher.discard_unsent();
}
