use std::time::Duration;

use super::{Backoff, RetryClassifier, TransientFailureClassifier};
use crate::net::transport::{TransportError, TransportResponse};

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait between attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Decides whether, and when, a failed attempt is retried.
pub trait RetryPolicy: Send + Sync {
    /// Returns `true` if the request should be attempted again after the given outcome.
    ///
    /// `attempt` is the number of attempts made so far, starting at one.
    fn should_retry(&self, outcome: &Result<TransportResponse, TransportError>, attempt: u32) -> bool;

    /// Returns how long to wait before the next attempt.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// A retry policy that never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _: &Result<TransportResponse, TransportError>, _: u32) -> bool {
        false
    }

    fn backoff(&self, _: u32) -> Duration {
        Duration::ZERO
    }
}

/// A bounded retry policy.
///
/// Outcomes are classified by a [`RetryClassifier`], and an attempt classified as retryable is retried as long as no
/// more than `max_retries` attempts have been made. With the default of three, a request is attempted at most four
/// times.
#[derive(Clone, Debug)]
pub struct StandardRetryPolicy<C = TransientFailureClassifier> {
    classifier: C,
    backoff: Backoff,
    max_retries: u32,
}

impl StandardRetryPolicy {
    /// Creates a new `StandardRetryPolicy` that retries transient failures up to `max_retries` times, waiting
    /// [`DEFAULT_RETRY_BACKOFF`] between attempts.
    pub fn new(max_retries: u32) -> Self {
        Self {
            classifier: TransientFailureClassifier,
            backoff: Backoff::Constant(DEFAULT_RETRY_BACKOFF),
            max_retries,
        }
    }
}

impl Default for StandardRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl<C> StandardRetryPolicy<C> {
    /// Sets the backoff strategy.
    ///
    /// Defaults to a constant [`DEFAULT_RETRY_BACKOFF`].
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the classifier used to decide which outcomes are retryable.
    pub fn with_classifier<C2>(self, classifier: C2) -> StandardRetryPolicy<C2> {
        StandardRetryPolicy {
            classifier,
            backoff: self.backoff,
            max_retries: self.max_retries,
        }
    }

    /// Returns the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl<C> RetryPolicy for StandardRetryPolicy<C>
where
    C: RetryClassifier<TransportResponse, TransportError> + Send + Sync,
{
    fn should_retry(&self, outcome: &Result<TransportResponse, TransportError>, attempt: u32) -> bool {
        attempt <= self.max_retries && self.classifier.should_retry(outcome)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff.get_backoff_duration(attempt)
    }
}
