use std::{fmt, time::Duration};

use http::StatusCode;
use tracing::{debug, warn};

use crate::net::transport::{TransportError, TransportResponse};

/// Hooks called around retry decisions.
pub trait RetryLifecycle<Res, Error>: Send + Sync {
    /// Called when an attempt is about to be retried.
    fn before_retry(&self, url: &str, res: &Result<Res, Error>, retry_backoff: Duration, attempt: u32);

    /// Called when an attempt succeeded.
    fn after_success(&self, url: &str, attempt: u32);
}

/// A retry lifecycle that logs why an attempt is being retried.
///
/// Retries are logged at warn level with the request URL (without its query string) and a description of the failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRetryLifecycle;

impl RetryLifecycle<TransportResponse, TransportError> for StandardRetryLifecycle {
    fn before_retry(
        &self, url: &str, res: &Result<TransportResponse, TransportError>, retry_backoff: Duration, attempt: u32,
    ) {
        let endpoint = SanitizedUrl(url);
        let failure = CategorizedFailure::from_result(res);
        warn!(attempt, %endpoint, "{}. Retrying after {:?}.", failure, retry_backoff);
    }

    fn after_success(&self, url: &str, attempt: u32) {
        let endpoint = SanitizedUrl(url);
        debug!(attempt, %endpoint, "Request succeeded.");
    }
}

struct SanitizedUrl<'a>(&'a str);

impl fmt::Display for SanitizedUrl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.find(['?', '#']).unwrap_or(self.0.len());
        f.write_str(&self.0[..end])
    }
}

enum CategorizedFailure<'a> {
    Http(StatusCode),
    Transport(&'a TransportError),
}

impl<'a> CategorizedFailure<'a> {
    fn from_result(res: &'a Result<TransportResponse, TransportError>) -> Self {
        match res {
            Ok(resp) => Self::Http(resp.status),
            Err(e) => Self::Transport(e),
        }
    }
}

impl fmt::Display for CategorizedFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(status) => write!(f, "Server responded with non-success status code {}", status.as_str()),
            Self::Transport(TransportError::InvalidResponse { reason }) => {
                write!(f, "Server sent a response that could not be interpreted: {}", reason)
            }
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_url_drops_query() {
        assert_eq!(
            SanitizedUrl("https://ingest.us1.signalfx.com:443/v2/datapoint?debug=1").to_string(),
            "https://ingest.us1.signalfx.com:443/v2/datapoint"
        );
        assert_eq!(SanitizedUrl("http://localhost/v2").to_string(), "http://localhost/v2");
    }

    #[test]
    fn failures_are_described() {
        let res = Ok(TransportResponse::new(StatusCode::SERVICE_UNAVAILABLE, ""));
        assert_eq!(
            CategorizedFailure::from_result(&res).to_string(),
            "Server responded with non-success status code 503"
        );

        let res = Err(TransportError::Io {
            reason: "broken pipe".to_string(),
        });
        assert_eq!(
            CategorizedFailure::from_result(&res).to_string(),
            "Request failed: broken pipe"
        );
    }
}
