use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use sluice_config::GenericConfiguration;
use sluice_core::{
    buffer::{bounded, EnqueueError, OverflowPolicy, PointBuffer},
    metric::{MetricKind, MetricPoint, MetricValue},
};
use sluice_error::GenericError;
use sluice_io::{
    compression::CompressionScheme,
    encoding::{Encoder, EncodingFormat},
    net::{
        retry::RetryPolicy,
        transport::{HttpTransport, Transport},
        IngestClient,
    },
};
use snafu::ResultExt as _;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

use crate::{
    auth::{AuthTokenProvider, StaticAuthToken},
    batcher::{supervise, Batcher},
    config::{Endpoint, SenderConfiguration},
    handler::{ErrorHandlers, MetricError, MetricErrorKind, OnSendErrorHandler},
    runtime::spawn_dedicated,
    session::Session,
    telemetry::{SenderStats, SenderTelemetry},
    Enqueue, InvalidPoint, Runtime, SenderError,
};

const DEFAULT_SENDER_NAME: &str = "sluice";

/// Builds a [`MetricSender`].
///
/// Only an authentication token is required. Everything else defaults to the values of [`SenderConfiguration`]:
/// protobuf encoding, gzip compression, the standard retry policy, and an HTTP transport for the configured endpoint.
pub struct MetricSenderBuilder {
    name: String,
    config: SenderConfiguration,
    auth: Option<Arc<dyn AuthTokenProvider>>,
    encoder: Option<Arc<dyn Encoder>>,
    transport: Option<Arc<dyn Transport>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    handlers: Vec<Arc<dyn OnSendErrorHandler>>,
}

impl MetricSenderBuilder {
    /// Creates a builder from an existing configuration.
    pub fn with_configuration(config: SenderConfiguration) -> Self {
        Self {
            name: DEFAULT_SENDER_NAME.to_string(),
            config,
            auth: None,
            encoder: None,
            transport: None,
            retry_policy: None,
            handlers: Vec::new(),
        }
    }

    /// Creates a builder from the given configuration.
    ///
    /// # Errors
    ///
    /// If the sender configuration cannot be deserialized, or is invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        SenderConfiguration::from_configuration(config).map(Self::with_configuration)
    }

    /// Sets the name of the sender.
    ///
    /// The name labels the sender's telemetry and log output, and names its background thread. Defaults to `sluice`.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Sets a fixed authentication token.
    pub fn auth_token<S: Into<String>>(self, token: S) -> Self {
        self.auth_token_provider(StaticAuthToken::new(token))
    }

    /// Sets the authentication token provider.
    pub fn auth_token_provider<P>(mut self, provider: P) -> Self
    where
        P: AuthTokenProvider + 'static,
    {
        self.auth = Some(Arc::new(provider));
        self
    }

    /// Sets the ingest endpoint.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    /// Sets the ingest endpoint to the one for the given realm, such as `us1`.
    pub fn realm(self, realm: &str) -> Self {
        self.endpoint(Endpoint::for_realm(realm))
    }

    /// Sets the maximum number of buffered points.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.config.max_buffer_size = max_buffer_size;
        self
    }

    /// Sets the maximum number of points per request.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.config.max_batch_size = max_batch_size;
        self
    }

    /// Sets the interval between flushes.
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.config.flush_interval_ms = flush_interval.as_millis() as u64;
        self
    }

    /// Sets how long [`MetricSender::shutdown`] waits for buffered points to be sent.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = shutdown_timeout.as_millis() as u64;
        self
    }

    /// Sets the overflow policy.
    pub fn overflow_policy(mut self, overflow_policy: OverflowPolicy) -> Self {
        self.config.overflow_policy = overflow_policy;
        self
    }

    /// Sets the payload encoding.
    pub fn encoding(mut self, encoding: EncodingFormat) -> Self {
        self.config.encoding = encoding;
        self.encoder = None;
        self
    }

    /// Sets a custom encoder, overriding the configured encoding.
    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Sets whether request bodies are compressed with gzip.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Sets a custom transport, instead of the default HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets a custom retry policy, instead of the one described by the retry configuration.
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Adds a handler for delivery errors.
    ///
    /// Handlers are called in the order they were added.
    pub fn error_handler(mut self, handler: Arc<dyn OnSendErrorHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Builds the sender.
    ///
    /// The sender is not started: points can be recorded right away, but nothing is sent until
    /// [`MetricSender::start`] is called.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, no authentication token was set, or the default transport cannot be created,
    /// an error is returned.
    pub fn build(self) -> Result<MetricSender, SenderError> {
        let Self {
            name,
            config,
            auth,
            encoder,
            transport,
            retry_policy,
            handlers,
        } = self;

        config.validate()?;
        let auth = auth.ok_or_else(|| SenderError::InvalidConfiguration {
            reason: "an authentication token or token provider is required".to_string(),
        })?;

        let transport = match transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(config.connection_mode(), config.request_timeout())
                    .context(crate::Transport)?,
            ),
        };
        let retry_policy = retry_policy.unwrap_or_else(|| Arc::new(config.retry().to_policy()));
        let encoder = encoder.unwrap_or_else(|| config.encoding().encoder());
        let client = IngestClient::new(transport, retry_policy, config.ingest_url())
            .with_compression(CompressionScheme::from_enabled(config.compression()));

        let telemetry = SenderTelemetry::new(&name);
        let handlers = ErrorHandlers::new(handlers);
        let (buffer, receiver) = bounded(config.max_buffer_size(), config.overflow_policy());

        let batcher = Batcher {
            receiver,
            encoder,
            client,
            auth,
            handlers: handlers.clone(),
            telemetry: telemetry.clone(),
            max_batch_size: config.max_batch_size(),
            flush_interval: config.flush_interval(),
            in_flight: 0,
        };

        Ok(MetricSender {
            name,
            config,
            buffer,
            state: Mutex::new(SenderState::Idle(Box::new(batcher))),
            stopping: AtomicBool::new(false),
            telemetry,
            handlers,
        })
    }
}

enum SenderState {
    Idle(Box<Batcher>),
    Running {
        stop_tx: oneshot::Sender<Instant>,
        thread: JoinHandle<()>,
    },
    Stopped,
}

/// Buffers metric points and delivers them in batches from a background thread.
///
/// Recording never waits on the network: points go into a bounded buffer, and delivery failures are reported to the
/// registered error handlers rather than to the code recording points. Any number of threads can record points through
/// a shared reference to the sender.
pub struct MetricSender {
    name: String,
    config: SenderConfiguration,
    buffer: PointBuffer,
    state: Mutex<SenderState>,
    stopping: AtomicBool,
    telemetry: SenderTelemetry,
    handlers: ErrorHandlers,
}

impl MetricSender {
    /// Creates a builder for a sender whose points default to the given source.
    pub fn builder<S: Into<String>>(default_source_name: S) -> MetricSenderBuilder {
        MetricSenderBuilder::with_configuration(SenderConfiguration::new(default_source_name))
    }

    /// Returns the name of the sender.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the sender configuration.
    pub fn configuration(&self) -> &SenderConfiguration {
        &self.config
    }

    /// Returns the source attached to points that do not name one.
    pub fn default_source_name(&self) -> &str {
        self.config.default_source_name()
    }

    /// Returns a snapshot of the sender's counters.
    pub fn stats(&self) -> SenderStats {
        self.telemetry.snapshot()
    }

    /// Returns `true` if the background thread is running.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), SenderState::Running { .. })
    }

    fn lock_state(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the background thread.
    ///
    /// # Errors
    ///
    /// If the sender was already started or stopped, or the background thread cannot be started, an error is returned.
    pub fn start(&self) -> Result<(), SenderError> {
        let mut state = self.lock_state();
        match mem::replace(&mut *state, SenderState::Stopped) {
            SenderState::Idle(batcher) => {
                let (stop_tx, stop_rx) = oneshot::channel();
                match spawn_dedicated(&self.name, supervise(*batcher, stop_rx)) {
                    Ok(thread) => {
                        *state = SenderState::Running { stop_tx, thread };
                        debug!(sender = %self.name, "Sender started.");
                        Ok(())
                    }
                    Err(e) => {
                        drop(state);
                        self.stopping.store(true, Ordering::Release);
                        self.report_unsent();
                        Err(e).context(Runtime)
                    }
                }
            }
            running @ SenderState::Running { .. } => {
                *state = running;
                Err(SenderError::AlreadyStarted)
            }
            SenderState::Stopped => Err(SenderError::Stopped),
        }
    }

    /// Stops the sender, waiting up to the configured shutdown timeout for buffered points to be sent.
    pub fn shutdown(&self) {
        self.stop(self.config.shutdown_timeout());
    }

    /// Stops the sender, waiting up to `timeout` for buffered points to be sent.
    ///
    /// New points are rejected as soon as this is called. Every point still buffered is sent, in batches, until the
    /// timeout elapses. At that point, any send in progress is abandoned, and every point not yet sent is counted as
    /// lost and reported to the error handlers as [`MetricErrorKind::ShutdownDataLoss`].
    ///
    /// Calling this more than once has no further effect.
    pub fn stop(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::Release);

        let previous = mem::replace(&mut *self.lock_state(), SenderState::Stopped);
        match previous {
            SenderState::Idle(batcher) => (*batcher).discard_unsent(),
            SenderState::Running { stop_tx, thread } => {
                debug!(sender = %self.name, ?timeout, "Stopping sender.");
                let _ = stop_tx.send(Instant::now() + timeout);
                if thread.join().is_err() {
                    warn!(sender = %self.name, "Sender thread panicked during shutdown.");
                    self.report_unsent();
                }
                debug!(sender = %self.name, "Sender stopped.");
            }
            SenderState::Stopped => {}
        }
    }

    /// Reports every point not yet resolved as lost, once the batcher is gone without accounting for them itself.
    fn report_unsent(&self) {
        let lost = self.telemetry.pending() as usize;
        if lost > 0 {
            self.telemetry.track_lost(lost);
            warn!(sender = %self.name, points = lost, "Sender stopped before points were sent.");
            self.handlers.report(MetricError::new(
                MetricErrorKind::ShutdownDataLoss,
                "Sender stopped before points were sent.",
                lost,
            ));
        }
    }

    /// Creates a session that aggregates points and commits them when closed.
    pub fn create_session(&self) -> Session<'_> {
        Session::new(self)
    }

    /// Records a gauge, timestamped with the current time.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or cannot be buffered, an error is returned.
    pub fn record_gauge<V>(&self, name: &str, value: V, dimensions: &[(&str, &str)]) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.record_gauge_at(name, value, dimensions, now_ms())
    }

    /// Records a gauge with an explicit timestamp, in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or cannot be buffered, an error is returned.
    pub fn record_gauge_at<V>(
        &self, name: &str, value: V, dimensions: &[(&str, &str)], timestamp_ms: i64,
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.record(name, MetricKind::Gauge, value.into(), dimensions, timestamp_ms)
    }

    /// Records a counter, timestamped with the current time.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or cannot be buffered, an error is returned.
    pub fn record_counter<V>(&self, name: &str, value: V, dimensions: &[(&str, &str)]) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.record_counter_at(name, value, dimensions, now_ms())
    }

    /// Records a counter with an explicit timestamp, in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or cannot be buffered, an error is returned.
    pub fn record_counter_at<V>(
        &self, name: &str, value: V, dimensions: &[(&str, &str)], timestamp_ms: i64,
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.record(name, MetricKind::Counter, value.into(), dimensions, timestamp_ms)
    }

    /// Records a cumulative counter, timestamped with the current time.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or cannot be buffered, an error is returned.
    pub fn record_cumulative_counter<V>(
        &self, name: &str, value: V, dimensions: &[(&str, &str)],
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.record_cumulative_counter_at(name, value, dimensions, now_ms())
    }

    /// Records a cumulative counter with an explicit timestamp, in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// If the point is invalid, or cannot be buffered, an error is returned.
    pub fn record_cumulative_counter_at<V>(
        &self, name: &str, value: V, dimensions: &[(&str, &str)], timestamp_ms: i64,
    ) -> Result<(), SenderError>
    where
        V: Into<MetricValue>,
    {
        self.record(name, MetricKind::CumulativeCounter, value.into(), dimensions, timestamp_ms)
    }

    fn record(
        &self, name: &str, kind: MetricKind, value: MetricValue, dimensions: &[(&str, &str)], timestamp_ms: i64,
    ) -> Result<(), SenderError> {
        let point = MetricPoint::builder(name, kind, value)
            .source(self.default_source_name())
            .dimensions(dimensions.iter().copied())
            .timestamp_ms(timestamp_ms)
            .build()
            .context(InvalidPoint)?;

        self.submit(1, |buffer| buffer.enqueue(point))
    }

    /// Submits a group of points to the buffer as one unit.
    pub(crate) fn submit_all(&self, points: Vec<MetricPoint>) -> Result<(), SenderError> {
        if points.is_empty() {
            return Ok(());
        }

        self.submit(points.len(), |buffer| buffer.enqueue_all(points))
    }

    fn submit<F>(&self, count: usize, enqueue: F) -> Result<(), SenderError>
    where
        F: FnOnce(&PointBuffer) -> Result<(), EnqueueError>,
    {
        if self.stopping.load(Ordering::Acquire) {
            self.telemetry.track_rejected(count);
            return Err(SenderError::Stopped);
        }

        match enqueue(&self.buffer) {
            Ok(()) => {
                self.telemetry.track_enqueued(count);
                Ok(())
            }
            Err(e) => {
                self.telemetry.track_rejected(count);
                debug!(sender = %self.name, points = count, error = %e, "Rejected points.");
                Err(e).context(Enqueue { points: count })
            }
        }
    }
}

impl Drop for MetricSender {
    fn drop(&mut self) {
        self.stop(self.config.shutdown_timeout());
    }
}

/// Returns the current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
