//! Retry policy for export attempts

use super::ErrorKind;
use crate::client::{ApiError, ApiResult};
use crate::config::ExportSettings;
use crate::shutdown::ShutdownCoordinator;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Initial backoff delay in milliseconds.
/// Long enough for a GitLab rate-limit window to start recovering.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum backoff delay in milliseconds.
/// Export queues drain slowly, so waits are allowed to grow to a minute.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Upper bound of the random jitter added to each delay
pub const MAX_JITTER_MS: u64 = 1000;

/// Attempt ceiling, backoff function and retryable-error predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per job (one attempt = one trigger→download cycle)
    pub max_attempts: u32,
    /// Base delay
    pub base_delay: Duration,
    /// Cap on the exponential part
    pub max_delay: Duration,
    /// Upper bound of uniform jitter
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_jitter: Duration::from_millis(MAX_JITTER_MS),
        }
    }
}

impl RetryPolicy {
    /// Policy with the configured attempt ceiling
    pub fn from_settings(settings: &ExportSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Whether `kind` may be retried at all
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind.is_retryable()
    }

    /// Whether another attempt is allowed after `attempts_made` attempts failed with `kind`
    pub fn should_retry(&self, kind: ErrorKind, attempts_made: u32) -> bool {
        self.is_retryable(kind) && attempts_made < self.max_attempts
    }

    /// Deterministic part of the delay after `attempts_made` failed attempts
    pub fn base_backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        let factor = 2u32.saturating_pow(exponent.min(31));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Delay before the next attempt, honoring a server retry-after hint as a floor
    pub fn delay_for(&self, attempts_made: u32, retry_after: Option<Duration>) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        let delay = self.base_backoff(attempts_made) + jitter;
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }

    /// Run one API request until it succeeds, fails permanently or runs out
    /// of attempts.
    ///
    /// The request and every backoff sleep are raced against `shutdown`;
    /// cancellation ends the loop with [`ApiError::Cancelled`].
    pub async fn call<T, F, Fut>(
        &self,
        shutdown: &ShutdownCoordinator,
        what: &str,
        mut request: F,
    ) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ApiError::Cancelled),
                result = request() => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(err.kind(), attempts) => err,
                Err(err) => return Err(err),
            };

            let delay = self.delay_for(attempts, err.retry_after());
            warn!(
                what,
                attempt = attempts,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Request failed, retrying"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
