//! Delivery error reporting.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
};

use sluice_error::GenericError;
use tracing::{error, warn};

/// Category of a delivery error.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricErrorKind {
    /// No authentication token was available.
    AuthToken,

    /// The batch could not be encoded.
    Encode,

    /// The batch could not be delivered.
    DatapointSend,

    /// Points were still unsent when the shutdown deadline passed.
    ShutdownDataLoss,
}

impl MetricErrorKind {
    const ALL: [MetricErrorKind; 4] = [
        MetricErrorKind::AuthToken,
        MetricErrorKind::Encode,
        MetricErrorKind::DatapointSend,
        MetricErrorKind::ShutdownDataLoss,
    ];

    const fn index(&self) -> usize {
        match self {
            Self::AuthToken => 0,
            Self::Encode => 1,
            Self::DatapointSend => 2,
            Self::ShutdownDataLoss => 3,
        }
    }

    /// Returns the name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthToken => "auth_token",
            Self::Encode => "encode",
            Self::DatapointSend => "datapoint_send",
            Self::ShutdownDataLoss => "shutdown_data_loss",
        }
    }
}

impl fmt::Display for MetricErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery error.
///
/// Delivery errors are never returned to the code recording points. Instead, they are passed to every registered
/// [`OnSendErrorHandler`] from the background thread.
#[derive(Debug)]
pub struct MetricError {
    kind: MetricErrorKind,
    message: String,
    points: usize,
    cause: Option<GenericError>,
}

impl MetricError {
    /// Creates a new `MetricError`.
    pub fn new<M: Into<String>>(kind: MetricErrorKind, message: M, points: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            points,
            cause: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_cause<E: Into<GenericError>>(mut self, cause: E) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> MetricErrorKind {
        self.kind
    }

    /// Returns a description of the error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the number of points affected.
    pub fn points(&self) -> usize {
        self.points
    }

    /// Returns the underlying cause, if any.
    pub fn cause(&self) -> Option<&GenericError> {
        self.cause.as_ref()
    }
}

impl fmt::Display for MetricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} point(s), kind: {})", self.message, self.points, self.kind)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {:#}", cause)?;
        }
        Ok(())
    }
}

/// Receives delivery errors.
///
/// Handlers are called synchronously from the background thread, so they should return quickly.
pub trait OnSendErrorHandler: Send + Sync {
    /// Handles a delivery error.
    fn handle_error(&self, error: &MetricError);
}

impl<F> OnSendErrorHandler for F
where
    F: Fn(&MetricError) + Send + Sync,
{
    fn handle_error(&self, error: &MetricError) {
        self(error)
    }
}

/// An error handler that logs every error.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingErrorHandler;

impl OnSendErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, error: &MetricError) {
        match error.kind() {
            MetricErrorKind::ShutdownDataLoss => warn!(points = error.points(), "{}", error),
            kind => error!(%kind, points = error.points(), "{}", error),
        }
    }
}

/// An error handler that counts errors, in total and by kind.
#[derive(Debug, Default)]
pub struct CountingErrorHandler {
    total: AtomicU64,
    by_kind: [AtomicU64; 4],
}

impl CountingErrorHandler {
    /// Creates a new `CountingErrorHandler`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of errors handled.
    pub fn total(&self) -> u64 {
        self.total.load(Relaxed)
    }

    /// Returns the number of errors of the given kind handled.
    pub fn count(&self, kind: MetricErrorKind) -> u64 {
        self.by_kind[kind.index()].load(Relaxed)
    }

    /// Returns the number of errors handled for every kind.
    pub fn counts(&self) -> Vec<(MetricErrorKind, u64)> {
        MetricErrorKind::ALL.iter().map(|kind| (*kind, self.count(*kind))).collect()
    }
}

impl OnSendErrorHandler for CountingErrorHandler {
    fn handle_error(&self, error: &MetricError) {
        self.total.fetch_add(1, Relaxed);
        self.by_kind[error.kind().index()].fetch_add(1, Relaxed);
    }
}

/// The error handlers registered with a sender.
#[derive(Clone, Default)]
pub(crate) struct ErrorHandlers {
    handlers: Arc<[Arc<dyn OnSendErrorHandler>]>,
}

impl ErrorHandlers {
    pub fn new(handlers: Vec<Arc<dyn OnSendErrorHandler>>) -> Self {
        Self {
            handlers: handlers.into(),
        }
    }

    pub fn report(&self, error: MetricError) {
        for handler in self.handlers.iter() {
            handler.handle_error(&error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sluice_error::generic_error;

    use super::*;

    #[test]
    fn counting_handler_tracks_kinds() {
        let handler = CountingErrorHandler::new();
        handler.handle_error(&MetricError::new(MetricErrorKind::DatapointSend, "failed", 10));
        handler.handle_error(&MetricError::new(MetricErrorKind::DatapointSend, "failed", 10));
        handler.handle_error(&MetricError::new(MetricErrorKind::AuthToken, "no token", 3));

        assert_eq!(handler.total(), 3);
        assert_eq!(handler.count(MetricErrorKind::DatapointSend), 2);
        assert_eq!(handler.count(MetricErrorKind::AuthToken), 1);
        assert_eq!(handler.count(MetricErrorKind::Encode), 0);
        assert_eq!(handler.counts().len(), 4);
    }

    #[test]
    fn every_handler_is_called() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            move |error: &MetricError| seen.lock().unwrap().push(error.kind())
        };
        let counter = Arc::new(CountingErrorHandler::new());

        let handlers = ErrorHandlers::new(vec![
            Arc::new(recorder),
            Arc::clone(&counter) as Arc<dyn OnSendErrorHandler>,
            Arc::new(LoggingErrorHandler),
        ]);
        handlers.report(MetricError::new(MetricErrorKind::ShutdownDataLoss, "lost", 5));

        assert_eq!(*seen.lock().unwrap(), vec![MetricErrorKind::ShutdownDataLoss]);
        assert_eq!(counter.total(), 1);
    }

    #[test]
    fn display_includes_cause() {
        let error = MetricError::new(MetricErrorKind::Encode, "Failed to encode batch.", 2)
            .with_cause(generic_error!("metric 'x' is NaN"));
        assert_eq!(
            error.to_string(),
            "Failed to encode batch. (2 point(s), kind: encode): metric 'x' is NaN"
        );
    }
}
