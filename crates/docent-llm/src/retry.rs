use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before retry number `attempt` (zero-based): `base * 2^attempt`, capped at `cap`.
#[must_use]
pub fn exponential_backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Parse the `Retry-After` header value as seconds, falling back to exponential backoff.
pub(crate) fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    if let Some(val) = response.headers().get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Duration::from_secs(secs).min(MAX_BACKOFF);
    }
    exponential_backoff(BASE_BACKOFF, attempt, MAX_BACKOFF)
}

/// Send an HTTP request, retrying up to `max_retries` times on 429 responses.
///
/// Any other status is returned to the caller untouched.
///
/// # Errors
///
/// Returns `LlmError::RateLimited` if every attempt was rate limited, or the
/// transport error wrapped as `LlmError::Http`.
pub(crate) async fn send_with_retry<F, Fut>(
    provider_name: &str,
    max_retries: u32,
    mut f: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    for attempt in 0..=max_retries {
        let response = f().await?;
        if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }
        if attempt == max_retries {
            break;
        }
        let delay = retry_delay(&response, attempt);
        tracing::warn!(
            provider = provider_name,
            delay_secs = delay.as_secs(),
            attempt = attempt + 1,
            max_retries,
            "rate limited, retrying"
        );
        tokio::time::sleep(delay).await;
    }

    Err(LlmError::RateLimited)
}

/// Turn a non-success response into `LlmError::Status`, keeping the body for diagnostics.
pub(crate) async fn check_status(
    provider_name: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LlmError::Status {
        provider: provider_name.to_owned(),
        status: status.as_u16(),
        body,
    })
}
