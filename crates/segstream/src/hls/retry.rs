// Retry with exponential backoff, shared by manifest, segment and key fetching.

use crate::error::StreamError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff schedule for one kind of request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on every following retry.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random jitter, never exceeding `max_delay`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after the failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt saturates instead of overflowing for absurd attempt counts.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let headroom_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(headroom_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Outcome of one attempt as seen by [`retry_with_backoff`].
pub enum RetryAction<T> {
    Success(T),
    /// Failed, another attempt may succeed.
    Retry(StreamError),
    /// Failed for good.
    Fail(StreamError),
}

impl<T> From<Result<T, StreamError>> for RetryAction<T> {
    fn from(result: Result<T, StreamError>) -> Self {
        match result {
            Ok(value) => RetryAction::Success(value),
            Err(e) if e.is_retryable() => RetryAction::Retry(e),
            Err(e) => RetryAction::Fail(e),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, exhausts the
/// policy, or `token` is cancelled.
///
/// The closure receives the 0-indexed attempt number. Cancellation is only
/// observed between attempts and during the backoff sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    what: &str,
    operation: F,
) -> Result<T, StreamError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            what,
            attempt,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(StreamError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Connection, timeout and body errors may clear up on another attempt;
/// redirect and builder errors will not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
