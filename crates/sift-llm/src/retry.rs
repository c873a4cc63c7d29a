use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Parse the `Retry-After` header value as seconds, falling back to the policy backoff.
pub(crate) fn retry_delay(response: &reqwest::Response, policy: &RetryPolicy, attempt: u32) -> Duration {
    if let Some(val) = response.headers().get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.parse::<u64>()
    {
        return Duration::from_secs(secs).min(policy.max_delay);
    }
    policy.backoff(attempt)
}

/// Send an HTTP request, retrying on 429, 5xx and transport-level transient failures.
///
/// `f` builds and sends a fresh request on every call. Non-retryable statuses are
/// returned to the caller as a successful `Response` for further processing.
///
/// # Errors
///
/// Returns `LlmError::RateLimited` if all attempts were rate limited, `LlmError::Api` if
/// the last attempt hit a server error, or `LlmError::Http` for transport failures.
pub(crate) async fn send_with_retry<F, Fut>(
    provider_name: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    for attempt in 0..=policy.max_retries {
        let last = attempt == policy.max_retries;
        let response = match f().await {
            Ok(response) => response,
            Err(e) => {
                let err = LlmError::Http(e);
                if last || !err.is_transient() {
                    return Err(err);
                }
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    provider = provider_name,
                    attempt = attempt + 1,
                    "request failed, retrying in {}ms: {err}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if last {
                return Err(LlmError::RateLimited);
            }
            let delay = retry_delay(&response, policy, attempt);
            tracing::warn!(
                provider = provider_name,
                "rate limited, retrying in {}ms ({}/{})",
                delay.as_millis(),
                attempt + 1,
                policy.max_retries
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        if status.is_server_error() {
            if last {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api {
                    provider: provider_name,
                    status: status.as_u16(),
                    body,
                });
            }
            let delay = policy.backoff(attempt);
            tracing::warn!(
                provider = provider_name,
                %status,
                "server error, retrying in {}ms ({}/{})",
                delay.as_millis(),
                attempt + 1,
                policy.max_retries
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Ok(response);
    }

    Err(LlmError::RateLimited)
}
