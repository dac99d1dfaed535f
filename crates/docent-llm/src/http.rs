//! Shared HTTP client construction for consistent timeout and TLS configuration.

use std::time::Duration;

use crate::error::LlmError;

/// Build an HTTP client with a connect timeout, a whole-request timeout and
/// a `docent/{version}` user-agent.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_client(request_timeout: Duration) -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(request_timeout)
        .user_agent(concat!("docent/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}
