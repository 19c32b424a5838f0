//! Authentication tokens.
use snafu::Snafu;

/// No authentication token is available.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(display("No authentication token available: {}", reason))]
pub struct NoAuthToken {
    reason: String,
}

impl NoAuthToken {
    /// Creates a new `NoAuthToken` with the given reason.
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self { reason: reason.into() }
    }

    /// Returns the reason no token is available.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Provides the token used to authenticate with the ingest endpoint.
///
/// The token is requested once per batch, so providers can rotate tokens without restarting the sender.
pub trait AuthTokenProvider: Send + Sync {
    /// Returns the current token.
    ///
    /// # Errors
    ///
    /// If no token is currently available, an error is returned, and the batch being sent is dropped.
    fn auth_token(&self) -> Result<String, NoAuthToken>;
}

impl<F> AuthTokenProvider for F
where
    F: Fn() -> Result<String, NoAuthToken> + Send + Sync,
{
    fn auth_token(&self) -> Result<String, NoAuthToken> {
        self()
    }
}

/// A fixed authentication token.
#[derive(Clone)]
pub struct StaticAuthToken {
    token: String,
}

impl StaticAuthToken {
    /// Creates a new `StaticAuthToken`.
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self { token: token.into() }
    }
}

impl std::fmt::Debug for StaticAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAuthToken").field("token", &"<redacted>").finish()
    }
}

impl AuthTokenProvider for StaticAuthToken {
    fn auth_token(&self) -> Result<String, NoAuthToken> {
        if self.token.is_empty() {
            Err(NoAuthToken::new("configured token is empty"))
        } else {
            Ok(self.token.clone())
        }
    }
}
