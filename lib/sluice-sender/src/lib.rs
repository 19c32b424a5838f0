//! Batched delivery of metric points to an ingest endpoint.
//!
//! A [`MetricSender`] owns a bounded buffer and a background thread that drains it into batches, encodes them, and
//! posts them to the ingest endpoint with retries. Producers record points either directly on the sender or through a
//! [`Session`], which aggregates points and commits them to the buffer as a single unit.
#![deny(warnings)]
#![deny(missing_docs)]

use sluice_core::{buffer::EnqueueError, metric::PointError};
use sluice_error::GenericError;
use snafu::Snafu;

mod auth;
pub use self::auth::{AuthTokenProvider, NoAuthToken, StaticAuthToken};

mod batcher;

pub mod config;

mod handler;
pub use self::handler::{CountingErrorHandler, LoggingErrorHandler, MetricError, MetricErrorKind, OnSendErrorHandler};

mod runtime;

mod sender;
pub use self::sender::{MetricSender, MetricSenderBuilder};

mod session;
pub use self::session::Session;

mod telemetry;
pub use self::telemetry::SenderStats;

/// A sender error.
///
/// These are the errors a producer can observe. Delivery failures are never returned here: they are reported to the
/// registered [`OnSendErrorHandler`]s instead.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SenderError {
    /// The configuration is invalid.
    #[snafu(display("Invalid configuration: {}", reason))]
    InvalidConfiguration {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// A point could not be built.
    #[snafu(display("Invalid point: {}", source))]
    InvalidPoint {
        /// Error source.
        source: PointError,
    },

    /// Points could not be added to the buffer.
    #[snafu(display("Failed to enqueue {} point(s): {}", points, source))]
    Enqueue {
        /// Number of points that were not enqueued.
        points: usize,

        /// Error source.
        source: EnqueueError,
    },

    /// The sender has been stopped.
    #[snafu(display("Sender is stopped."))]
    Stopped,

    /// The sender was already started.
    #[snafu(display("Sender is already started."))]
    AlreadyStarted,

    /// The session was already closed.
    #[snafu(display("Session is closed."))]
    SessionClosed,

    /// The default HTTP transport could not be created.
    #[snafu(display("Failed to create HTTP transport: {}", source))]
    Transport {
        /// Error source.
        source: GenericError,
    },

    /// The background thread could not be started.
    #[snafu(display("Failed to start background thread: {}", source))]
    Runtime {
        /// Error source.
        source: GenericError,
    },
}
