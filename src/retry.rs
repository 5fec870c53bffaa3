//! Retry/backoff decorator for rate-limited upstream calls.
//!
//! Every GitHub call in this crate goes through [`fetch_with_retry`] instead of
//! re-implementing backoff at each call site. Rate-limit rejections wait until
//! the quota window resets (never less than a configured floor); everything
//! else backs off exponentially.

use crate::error::FetchError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Tuning for one wrapped upstream call.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub rate_limit_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            rate_limit_floor: Duration::from_secs(10),
        }
    }
}

/// Runs `operation` up to `policy.max_attempts` times, sleeping between
/// attempts per [`retry_wait`]. After exhausting retries the last error is
/// propagated untouched.
pub async fn fetch_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                let wait = retry_wait(&err, attempt, policy, Utc::now());
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "upstream call failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Wait before the next attempt. Pure so the rate-limit and backoff math can
/// be tested without sleeping.
pub fn retry_wait(
    error: &FetchError,
    attempt: u32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Duration {
    match error {
        FetchError::RateLimited { reset } => {
            // Wait until the quota window resets; a missing reset header
            // falls back to one minute, matching GitHub's secondary limits.
            let reset = reset.unwrap_or_else(|| now + chrono::Duration::seconds(60));
            let until_reset = reset.signed_duration_since(now).to_std().unwrap_or_default();
            until_reset.max(policy.rate_limit_floor)
        }
        _ => policy.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)),
    }
}
