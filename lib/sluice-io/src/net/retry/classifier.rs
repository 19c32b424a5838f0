use http::StatusCode;

use crate::net::transport::{TransportError, TransportResponse};

// Not a registered status, but some proxies in front of ingest endpoints use it for network read timeouts.
const NETWORK_READ_TIMEOUT: u16 = 598;

/// Determines whether or not a request should be retried.
///
/// Classification only looks at the outcome of a single attempt. How many attempts have been made, and how long to
/// wait before the next one, is up to the [`RetryPolicy`][super::RetryPolicy].
pub trait RetryClassifier<Res, Error> {
    /// Returns `true` if the original request should be retried.
    fn should_retry(&self, response: &Result<Res, Error>) -> bool;
}

/// A classifier that retries transient failures.
///
/// The following responses are considered transient:
///
/// - 408 Request Timeout
/// - 503 Service Unavailable
/// - 504 Gateway Timeout
/// - 598 Network Read Timeout
///
/// Every other response, successful or not, is final. Transport failures are retried, with the exception of an
/// unresolvable host, a refused connection, or an interrupted request, none of which are expected to resolve
/// themselves in the time it takes to retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransientFailureClassifier;

impl TransientFailureClassifier {
    fn is_transient_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) || status.as_u16() == NETWORK_READ_TIMEOUT
    }
}

impl RetryClassifier<TransportResponse, TransportError> for TransientFailureClassifier {
    fn should_retry(&self, response: &Result<TransportResponse, TransportError>) -> bool {
        match response {
            Ok(resp) => Self::is_transient_status(resp.status),
            Err(e) => !matches!(
                e,
                TransportError::HostUnresolvable { .. }
                    | TransportError::ConnectionRefused { .. }
                    | TransportError::Interrupted { .. }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(StatusCode::from_u16(code).unwrap(), "x"))
    }

    #[test]
    fn transient_statuses_are_retried() {
        let classifier = TransientFailureClassifier;
        for code in [408, 503, 504, 598] {
            assert!(classifier.should_retry(&status(code)), "{} should be retried", code);
        }
    }

    #[test]
    fn other_statuses_are_final() {
        let classifier = TransientFailureClassifier;
        for code in [200, 400, 401, 403, 404, 413, 500, 502] {
            assert!(!classifier.should_retry(&status(code)), "{} should not be retried", code);
        }
    }

    #[test]
    fn transport_failures() {
        let classifier = TransientFailureClassifier;
        let reason = "x".to_string();

        assert!(classifier.should_retry(&Err(TransportError::InvalidResponse { reason: reason.clone() })));
        assert!(classifier.should_retry(&Err(TransportError::Io { reason: reason.clone() })));
        assert!(!classifier.should_retry(&Err(TransportError::HostUnresolvable { reason: reason.clone() })));
        assert!(!classifier.should_retry(&Err(TransportError::ConnectionRefused { reason: reason.clone() })));
        assert!(!classifier.should_retry(&Err(TransportError::Interrupted { reason })));
    }
}
