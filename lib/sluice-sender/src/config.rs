//! Sender configuration.
use std::time::Duration;

use serde::Deserialize;
use sluice_config::GenericConfiguration;
use sluice_core::buffer::OverflowPolicy;
use sluice_error::GenericError;
use sluice_io::{
    encoding::EncodingFormat,
    net::{
        retry::{Backoff, ExponentialBackoff, StandardRetryPolicy, DEFAULT_RETRY_BACKOFF},
        transport::ConnectionMode,
    },
};

use crate::SenderError;

const DEFAULT_INGEST_PATH: &str = "/v2/datapoint";
const DEFAULT_HOSTNAME: &str = "ingest.signalfx.com";
const DEFAULT_SCHEME: &str = "https";

const fn default_port() -> u16 {
    443
}

const fn default_max_buffer_size() -> usize {
    10_000
}

const fn default_max_batch_size() -> usize {
    1_000
}

const fn default_flush_interval_ms() -> u64 {
    1_000
}

const fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

const fn default_request_timeout_ms() -> u64 {
    2_000
}

const fn default_compression() -> bool {
    true
}

const fn default_max_connections() -> usize {
    8
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_millis() as u64
}

const fn default_backoff_max_ms() -> u64 {
    1_000
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_ingest_path() -> String {
    DEFAULT_INGEST_PATH.to_string()
}

/// Location of the ingest endpoint.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Endpoint {
    /// URL scheme.
    ///
    /// Defaults to `https`.
    #[serde(default = "default_scheme")]
    scheme: String,

    /// Host name.
    ///
    /// Defaults to `ingest.signalfx.com`.
    #[serde(default = "default_hostname")]
    hostname: String,

    /// Port.
    ///
    /// Defaults to 443.
    #[serde(default = "default_port")]
    port: u16,
}

impl Endpoint {
    /// Creates a new `Endpoint`.
    pub fn new<S, H>(scheme: S, hostname: H, port: u16) -> Self
    where
        S: Into<String>,
        H: Into<String>,
    {
        Self {
            scheme: scheme.into(),
            hostname: hostname.into(),
            port,
        }
    }

    /// Creates the endpoint for the given realm, such as `us1`.
    pub fn for_realm(realm: &str) -> Self {
        Self::new(DEFAULT_SCHEME, format!("ingest.{}.signalfx.com", realm), default_port())
    }

    /// Returns the URL scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host name.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the URL for the given path on this endpoint.
    pub fn url(&self, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, self.hostname, self.port, path)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEME, DEFAULT_HOSTNAME, default_port())
    }
}

/// Connection management for the HTTP transport.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionModeKind {
    /// One connection, with requests sent one at a time.
    #[default]
    Single,

    /// A shared pool of up to `max_connections` connections.
    Pooled,
}

/// Backoff between retries.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Wait `backoff_base_ms` before every retry.
    #[default]
    Constant,

    /// Double the wait with each retry, starting at `backoff_base_ms`, up to `backoff_max_ms`.
    Exponential,
}

/// Retry configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RetryConfiguration {
    /// Maximum number of retries after the first attempt.
    ///
    /// Defaults to 3.
    #[serde(default = "default_max_retries")]
    max_retries: u32,

    /// Backoff strategy.
    ///
    /// Defaults to `constant`.
    #[serde(default)]
    backoff: BackoffKind,

    /// Base backoff duration, in milliseconds.
    ///
    /// Defaults to 100 milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,

    /// Maximum backoff duration, in milliseconds.
    ///
    /// Defaults to 1000 milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    backoff_max_ms: u64,
}

impl RetryConfiguration {
    /// Returns the maximum number of retries.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Sets the maximum number of retries.
    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    /// Sets the backoff strategy and its bounds.
    pub fn set_backoff(&mut self, backoff: BackoffKind, base: Duration, max: Duration) {
        self.backoff = backoff;
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
    }

    /// Returns the configured backoff.
    pub fn backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.backoff_base_ms);
        match self.backoff {
            BackoffKind::Constant => Backoff::Constant(base),
            BackoffKind::Exponential => Backoff::Exponential(ExponentialBackoff::new(
                base,
                Duration::from_millis(self.backoff_max_ms),
            )),
        }
    }

    /// Builds the retry policy described by this configuration.
    pub fn to_policy(&self) -> StandardRetryPolicy {
        StandardRetryPolicy::new(self.max_retries).with_backoff(self.backoff())
    }
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Sender configuration.
///
/// Every field except `default_source_name` has a default, so the smallest valid configuration file is a single line
/// naming the source.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SenderConfiguration {
    /// Source attached to points that do not name one.
    pub(crate) default_source_name: String,

    /// Ingest endpoint.
    #[serde(default)]
    pub(crate) endpoint: Endpoint,

    /// Path points are posted to on the ingest endpoint.
    ///
    /// Defaults to `/v2/datapoint`.
    #[serde(default = "default_ingest_path")]
    pub(crate) ingest_path: String,

    /// Maximum number of points buffered while waiting to be sent.
    ///
    /// Defaults to 10000.
    #[serde(default = "default_max_buffer_size")]
    pub(crate) max_buffer_size: usize,

    /// Maximum number of points sent in a single request.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_max_batch_size")]
    pub(crate) max_batch_size: usize,

    /// Interval between flushes, in milliseconds.
    ///
    /// Defaults to 1000 milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub(crate) flush_interval_ms: u64,

    /// How long `stop` waits for buffered points to be sent, in milliseconds.
    ///
    /// Defaults to 10000 milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub(crate) shutdown_timeout_ms: u64,

    /// What happens when a point is recorded while the buffer is full.
    ///
    /// Defaults to `reject`.
    #[serde(default)]
    pub(crate) overflow_policy: OverflowPolicy,

    /// Payload encoding.
    ///
    /// Defaults to `protobuf`.
    #[serde(default)]
    pub(crate) encoding: EncodingFormat,

    /// Whether request bodies are compressed with gzip.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_compression")]
    pub(crate) compression: bool,

    /// Timeout for a single request, in milliseconds.
    ///
    /// Defaults to 2000 milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub(crate) request_timeout_ms: u64,

    /// Connection management for the HTTP transport.
    ///
    /// Defaults to `single`.
    #[serde(default)]
    pub(crate) connection_mode: ConnectionModeKind,

    /// Maximum number of connections in `pooled` mode.
    ///
    /// Defaults to 8.
    #[serde(default = "default_max_connections")]
    pub(crate) max_connections: usize,

    /// Retry configuration.
    #[serde(default)]
    pub(crate) retry: RetryConfiguration,
}

impl SenderConfiguration {
    /// Creates a default configuration with the given default source name.
    pub fn new<S: Into<String>>(default_source_name: S) -> Self {
        Self {
            default_source_name: default_source_name.into(),
            endpoint: Endpoint::default(),
            ingest_path: default_ingest_path(),
            max_buffer_size: default_max_buffer_size(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            overflow_policy: OverflowPolicy::default(),
            encoding: EncodingFormat::default(),
            compression: default_compression(),
            request_timeout_ms: default_request_timeout_ms(),
            connection_mode: ConnectionModeKind::default(),
            max_connections: default_max_connections(),
            retry: RetryConfiguration::default(),
        }
    }

    /// Creates a new `SenderConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, or is invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let sender_config = config.as_typed::<Self>()?;
        sender_config.validate()?;
        Ok(sender_config)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// If the default source name is empty, either size limit is zero, or the batch size is larger than the buffer
    /// size, an error is returned.
    pub fn validate(&self) -> Result<(), SenderError> {
        let reason = if self.default_source_name.trim().is_empty() {
            "default source name must not be empty"
        } else if self.max_buffer_size == 0 {
            "max_buffer_size must be greater than zero"
        } else if self.max_batch_size == 0 {
            "max_batch_size must be greater than zero"
        } else if self.max_batch_size > self.max_buffer_size {
            "max_batch_size must not be larger than max_buffer_size"
        } else if self.flush_interval_ms == 0 {
            "flush_interval_ms must be greater than zero"
        } else {
            return Ok(());
        };

        Err(SenderError::InvalidConfiguration {
            reason: reason.to_string(),
        })
    }

    /// Returns the default source name.
    pub fn default_source_name(&self) -> &str {
        &self.default_source_name
    }

    /// Returns the full URL points are posted to.
    pub fn ingest_url(&self) -> String {
        self.endpoint.url(&self.ingest_path)
    }

    /// Returns the maximum number of buffered points.
    pub const fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Returns the maximum number of points per request.
    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Returns the interval between flushes.
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns how long `stop` waits for buffered points to be sent.
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Returns the timeout for a single request.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Returns the overflow policy.
    pub const fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    /// Returns the payload encoding.
    pub const fn encoding(&self) -> EncodingFormat {
        self.encoding
    }

    /// Returns `true` if request bodies are compressed.
    pub const fn compression(&self) -> bool {
        self.compression
    }

    /// Returns the connection mode for the HTTP transport.
    pub const fn connection_mode(&self) -> ConnectionMode {
        match self.connection_mode {
            ConnectionModeKind::Single => ConnectionMode::Single,
            ConnectionModeKind::Pooled => ConnectionMode::Pooled {
                max_connections: self.max_connections,
            },
        }
    }

    /// Returns the retry configuration.
    pub const fn retry(&self) -> &RetryConfiguration {
        &self.retry
    }
}
