//! Retry decisions for delivery attempts.
mod backoff;
pub use self::backoff::{Backoff, ExponentialBackoff};

mod classifier;
pub use self::classifier::{RetryClassifier, TransientFailureClassifier};

mod lifecycle;
pub use self::lifecycle::{RetryLifecycle, StandardRetryLifecycle};

mod policy;
pub use self::policy::{NoRetryPolicy, RetryPolicy, StandardRetryPolicy, DEFAULT_RETRY_BACKOFF};
