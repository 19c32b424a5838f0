use std::time::Duration;

/// An exponential backoff strategy.
///
/// Backoff durations double with each attempt, starting from a minimum and never exceeding a maximum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given minimum and maximum backoff durations.
    ///
    /// If `max_backoff` is less than `min_backoff`, `min_backoff` is used for both.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }

    /// Calculates the backoff duration for the given attempt.
    ///
    /// The first attempt waits for the minimum backoff duration.
    pub fn get_backoff_duration(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.min_backoff;
        }

        self.min_backoff
            .saturating_mul(2u32.saturating_pow(attempt - 1))
            .clamp(self.min_backoff, self.max_backoff)
    }
}

/// How long to wait between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// Wait the same amount of time before every retry.
    Constant(Duration),

    /// Wait exponentially longer before each retry, up to a maximum.
    Exponential(ExponentialBackoff),
}

impl Backoff {
    /// Retry immediately.
    pub const fn none() -> Self {
        Self::Constant(Duration::ZERO)
    }

    /// Calculates the backoff duration for the given attempt.
    pub fn get_backoff_duration(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(duration) => *duration,
            Self::Exponential(backoff) => backoff.get_backoff_duration(attempt),
        }
    }
}
