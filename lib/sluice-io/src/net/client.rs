use std::{io, sync::Arc};

use bytes::Bytes;
use http::{
    header::{InvalidHeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT},
    HeaderMap, HeaderName, HeaderValue, StatusCode,
};
use snafu::{ResultExt as _, Snafu};
use tokio::time::sleep;
use tracing::trace;

use super::{
    retry::{RetryLifecycle, RetryPolicy, StandardRetryLifecycle},
    transport::{Transport, TransportError, TransportRequest, TransportResponse},
};
use crate::compression::CompressionScheme;

static AUTH_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-sf-token");
const ACKNOWLEDGEMENT: &[u8] = b"\"OK\"";

/// A failure to deliver a payload.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DeliveryError {
    /// The authentication token cannot be sent as a header value.
    #[snafu(display("Authentication token contains characters that are not valid in a header."))]
    InvalidToken {
        /// Error source.
        source: InvalidHeaderValue,
    },

    /// The payload could not be compressed.
    #[snafu(display("Failed to compress payload."))]
    Compression {
        /// Error source.
        source: io::Error,
    },

    /// The last attempt failed without a response.
    #[snafu(display("Failed to send payload after {} attempt(s).", attempts), context(suffix(Snafu)))]
    Transport {
        /// Number of attempts made.
        attempts: u32,

        /// Error source.
        source: TransportError,
    },

    /// The last attempt received a non-success response.
    #[snafu(display("Ingest endpoint responded with status {} after {} attempt(s).", status, attempts))]
    UnexpectedStatus {
        /// Number of attempts made.
        attempts: u32,

        /// Response status.
        status: StatusCode,
    },

    /// The endpoint responded with success, but did not acknowledge the payload.
    #[snafu(display("Ingest endpoint did not acknowledge payload (body: {:?}).", body))]
    UnexpectedAcknowledgement {
        /// Response body, lossily decoded.
        body: String,
    },
}

impl DeliveryError {
    /// Returns the number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::InvalidToken { .. } | Self::Compression { .. } => 0,
            Self::Transport { attempts, .. } | Self::UnexpectedStatus { attempts, .. } => *attempts,
            Self::UnexpectedAcknowledgement { .. } => 1,
        }
    }
}

/// A successful delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Delivery {
    /// Number of attempts made, including the successful one.
    pub attempts: u32,

    /// Size of the request body sent on the successful attempt, after compression.
    pub bytes_sent: usize,
}

/// Delivers encoded payloads to the ingest endpoint.
///
/// Each call to [`deliver`][Self::deliver] compresses the payload once, attaches the required headers, and then makes
/// attempts through the transport until the retry policy gives up. A payload only counts as delivered when the
/// endpoint answers with `200 OK` and an `"OK"` body.
pub struct IngestClient {
    transport: Arc<dyn Transport>,
    policy: Arc<dyn RetryPolicy>,
    lifecycle: StandardRetryLifecycle,
    compression: CompressionScheme,
    url: String,
    user_agent: HeaderValue,
}

impl IngestClient {
    /// Creates a new `IngestClient` that sends to `url`.
    ///
    /// Payloads are compressed with gzip by default.
    pub fn new(transport: Arc<dyn Transport>, policy: Arc<dyn RetryPolicy>, url: impl Into<String>) -> Self {
        Self {
            transport,
            policy,
            lifecycle: StandardRetryLifecycle,
            compression: CompressionScheme::gzip_default(),
            url: url.into(),
            user_agent: HeaderValue::from_static(concat!("sluice/", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Sets the compression scheme for request bodies.
    pub fn with_compression(mut self, compression: CompressionScheme) -> Self {
        self.compression = compression;
        self
    }

    /// Returns the URL payloads are sent to.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_request(
        &self, token: &str, content_type: &'static str, body: Bytes,
    ) -> Result<TransportRequest, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_TOKEN_HEADER.clone(), HeaderValue::from_str(token).context(InvalidToken)?);
        headers.insert(USER_AGENT, self.user_agent.clone());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        if let Some(encoding) = self.compression.content_encoding() {
            headers.insert(CONTENT_ENCODING, encoding);
        }

        Ok(TransportRequest {
            url: self.url.clone(),
            headers,
            body,
        })
    }

    /// Delivers a payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be prepared, the final attempt failed, or the endpoint did not acknowledge the
    /// payload, an error is returned.
    pub async fn deliver(
        &self, token: &str, content_type: &'static str, payload: Bytes,
    ) -> Result<Delivery, DeliveryError> {
        let body = self.compression.compress(payload).await.context(Compression)?;
        let bytes_sent = body.len();
        let request = self.build_request(token, content_type, body)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            trace!(attempt, bytes_sent, "Sending payload.");

            let outcome = self.transport.send(request.clone()).await;
            if self.policy.should_retry(&outcome, attempt) {
                let backoff = self.policy.backoff(attempt);
                self.lifecycle.before_retry(&self.url, &outcome, backoff, attempt);
                sleep(backoff).await;
                continue;
            }

            return match outcome {
                Ok(TransportResponse { status, body }) if status == StatusCode::OK => {
                    if is_acknowledgement(&body) {
                        self.lifecycle.after_success(&self.url, attempt);
                        Ok(Delivery { attempts: attempt, bytes_sent })
                    } else {
                        Err(DeliveryError::UnexpectedAcknowledgement {
                            body: String::from_utf8_lossy(&body).into_owned(),
                        })
                    }
                }
                Ok(TransportResponse { status, .. }) => Err(DeliveryError::UnexpectedStatus {
                    attempts: attempt,
                    status,
                }),
                Err(source) => Err(DeliveryError::Transport {
                    attempts: attempt,
                    source,
                }),
            };
        }
    }
}

fn is_acknowledgement(body: &[u8]) -> bool {
    body == ACKNOWLEDGEMENT
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::net::retry::{NoRetryPolicy, StandardRetryPolicy};

    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        requests: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            self.requests.lock().unwrap().push(request);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(StatusCode::OK, "\"OK\"")))
        }
    }

    fn ok() -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(StatusCode::OK, "\"OK\""))
    }

    fn status(code: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(StatusCode::from_u16(code).unwrap(), ""))
    }

    fn client(transport: Arc<ScriptedTransport>) -> IngestClient {
        IngestClient::new(
            transport,
            Arc::new(StandardRetryPolicy::default()),
            "http://localhost:8080/v2/datapoint",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn attaches_headers() {
        let transport = ScriptedTransport::new(vec![ok()]);
        let delivery = client(Arc::clone(&transport))
            .deliver("secret", "application/x-protobuf", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(delivery.attempts, 1);

        let requests = transport.requests.lock().unwrap();
        let headers = &requests[0].headers;
        assert_eq!(headers["x-sf-token"], "secret");
        assert_eq!(headers["content-type"], "application/x-protobuf");
        assert_eq!(headers["content-encoding"], "gzip");
        assert!(headers["user-agent"].to_str().unwrap().starts_with("sluice/"));
        assert_eq!(requests[0].url, "http://localhost:8080/v2/datapoint");
        assert_eq!(requests[0].body.len(), delivery.bytes_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn uncompressed_bodies_have_no_content_encoding() {
        let transport = ScriptedTransport::new(vec![ok()]);
        client(Arc::clone(&transport))
            .with_compression(CompressionScheme::noop())
            .deliver("secret", "application/json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].headers.get("content-encoding").is_none());
        assert_eq!(requests[0].body, Bytes::from_static(b"{}"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_statuses_exhaust_retries() {
        for code in [503, 598] {
            let transport = ScriptedTransport::new(vec![status(code); 10]);
            let result = client(Arc::clone(&transport))
                .deliver("t", "application/json", Bytes::new())
                .await;

            match result {
                Err(DeliveryError::UnexpectedStatus { attempts, status }) => {
                    assert_eq!(attempts, 4);
                    assert_eq!(status.as_u16(), code);
                }
                other => panic!("unexpected result: {:?}", other),
            }
            assert_eq!(transport.attempts(), 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_response_is_retried() {
        let invalid = Err(TransportError::InvalidResponse {
            reason: "status line missing".to_string(),
        });
        let transport = ScriptedTransport::new(vec![invalid; 10]);
        let result = client(Arc::clone(&transport))
            .deliver("t", "application/json", Bytes::new())
            .await;

        assert!(matches!(result, Err(DeliveryError::Transport { attempts: 4, .. })));
        assert_eq!(transport.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_request_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(400)]);
        let result = client(Arc::clone(&transport))
            .deliver("t", "application/json", Bytes::new())
            .await;

        assert!(matches!(result, Err(DeliveryError::UnexpectedStatus { attempts: 1, .. })));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_is_not_retried() {
        let refused = Err(TransportError::ConnectionRefused {
            reason: "refused".to_string(),
        });
        let transport = ScriptedTransport::new(vec![refused]);
        let result = client(Arc::clone(&transport))
            .deliver("t", "application/json", Bytes::new())
            .await;

        assert!(matches!(result, Err(DeliveryError::Transport { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let transport = ScriptedTransport::new(vec![status(503), status(408), ok()]);
        let delivery = client(Arc::clone(&transport))
            .deliver("t", "application/json", Bytes::new())
            .await
            .unwrap();
        assert_eq!(delivery.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_requires_acknowledgement() {
        // The acknowledgement is the JSON string, quotes included.
        let transport = ScriptedTransport::new(vec![Ok(TransportResponse::new(StatusCode::OK, "OK"))]);
        let result = client(Arc::clone(&transport))
            .deliver("t", "application/json", Bytes::new())
            .await;

        match result {
            Err(DeliveryError::UnexpectedAcknowledgement { body }) => assert_eq!(body, "OK"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_token_is_rejected_before_sending() {
        let transport = ScriptedTransport::new(vec![]);
        let result = IngestClient::new(Arc::clone(&transport) as Arc<dyn Transport>, Arc::new(NoRetryPolicy), "x")
            .deliver("bad\ntoken", "application/json", Bytes::new())
            .await;

        assert!(matches!(result, Err(DeliveryError::InvalidToken { .. })));
        assert_eq!(transport.attempts(), 0);
    }
}
