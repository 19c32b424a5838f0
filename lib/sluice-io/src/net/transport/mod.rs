//! Request transports.
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use snafu::Snafu;

mod http_client;
pub use self::http_client::{ConnectionMode, HttpTransport};

/// A request to send to the ingest endpoint.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// Full URL to POST to.
    pub url: String,

    /// Request headers.
    pub headers: HeaderMap,

    /// Request body.
    pub body: Bytes,
}

/// A response from the ingest endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    /// Response status.
    pub status: StatusCode,

    /// Response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Creates a new `TransportResponse`.
    pub fn new<B: Into<Bytes>>(status: StatusCode, body: B) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// A failure to complete a request.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransportError {
    /// The host name could not be resolved.
    #[snafu(display("Failed to resolve host: {}", reason))]
    HostUnresolvable {
        /// Underlying error description.
        reason: String,
    },

    /// The remote end refused the connection.
    #[snafu(display("Connection refused: {}", reason))]
    ConnectionRefused {
        /// Underlying error description.
        reason: String,
    },

    /// The request timed out or was cancelled.
    #[snafu(display("Request interrupted: {}", reason))]
    Interrupted {
        /// Underlying error description.
        reason: String,
    },

    /// A response was received, but its status could not be interpreted.
    #[snafu(display("Received an invalid response: {}", reason))]
    InvalidResponse {
        /// Underlying error description.
        reason: String,
    },

    /// Any other I/O failure.
    #[snafu(display("Request failed: {}", reason))]
    Io {
        /// Underlying error description.
        reason: String,
    },
}

/// Sends requests to the ingest endpoint.
///
/// A transport makes exactly one attempt per call. Retries are layered on top by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request, returning the response.
    ///
    /// # Errors
    ///
    /// If no response could be obtained, an error is returned describing why.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
