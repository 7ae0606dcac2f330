//! Bounded retry for upstream fetches.

use std::future::Future;
use std::time::Duration;

use corpus_core::{FetchError, FetchSettings};
use tracing::warn;

/// Per-attempt timeout, bounded re-attempts and linear backoff.
///
/// Attempt `n` (counting retries from 1) waits `backoff * n` before it
/// starts. An attempt that outlives `attempt_timeout` is dropped, which
/// aborts the in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff * retry
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut retry = 0;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout {
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    warn!(
                        error = %e,
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<&FetchSettings> for RetryPolicy {
    fn from(settings: &FetchSettings) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(settings.timeout_ms),
            max_retries: settings.max_retries,
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }
}
