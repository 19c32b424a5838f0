use std::{error::Error as _, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use sluice_error::{ErrorContext as _, GenericError};
use tokio::sync::Semaphore;
use tracing::trace;

use super::{Transport, TransportError, TransportRequest, TransportResponse};

/// How the HTTP transport manages its connections.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionMode {
    /// A single connection, with requests sent one at a time.
    Single,

    /// A shared pool of connections, with at most `max_connections` requests in flight.
    Pooled {
        /// Maximum number of concurrent requests.
        max_connections: usize,
    },
}

impl ConnectionMode {
    fn max_connections(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Pooled { max_connections } => (*max_connections).max(1),
        }
    }
}

/// An HTTP transport.
///
/// Every request is a POST. Requests beyond the connection limit of the configured [`ConnectionMode`] wait for an
/// earlier request to complete.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl HttpTransport {
    /// Creates a new `HttpTransport`.
    ///
    /// `request_timeout` bounds each request from connection until the response body is fully read.
    ///
    /// # Errors
    ///
    /// If the underlying client cannot be created, an error is returned.
    pub fn new(mode: ConnectionMode, request_timeout: Duration) -> Result<Self, GenericError> {
        let max_connections = mode.max_connections();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .pool_max_idle_per_host(max_connections)
            .build()
            .error_context("Failed to build HTTP client.")?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(max_connections)),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Interrupted {
                reason: "transport is shutting down".to_string(),
            })?;

        let body_len = request.body.len();
        let response = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(classify_error)?;
        trace!(%status, body_len, "Received response from ingest endpoint.");

        Ok(TransportResponse { status, body })
    }
}

fn classify_error(error: reqwest::Error) -> TransportError {
    let reason = describe_chain(&error);

    if error.is_timeout() {
        return TransportError::Interrupted { reason };
    }

    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(io_error) = inner.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionRefused => return TransportError::ConnectionRefused { reason },
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => return TransportError::Interrupted { reason },
                _ => {}
            }
        }
        source = inner.source();
    }

    // Resolver and parser failures only surface as text once they pass through the client.
    if error.is_connect() && (reason.contains("dns error") || reason.contains("failed to lookup address")) {
        return TransportError::HostUnresolvable { reason };
    }
    if error.is_decode() || reason.contains("invalid HTTP") {
        return TransportError::InvalidResponse { reason };
    }

    TransportError::Io { reason }
}

fn describe_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut reason = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let message = inner.to_string();
        if !reason.contains(&message) {
            reason.push_str(": ");
            reason.push_str(&message);
        }
        source = inner.source();
    }
    reason
}
