//! Bounded retry with exponential backoff for collaborator calls.

use super::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy applied to every collaborator call: each attempt gets a
/// per-call timeout; transient failures (including the timeout itself)
/// are retried with exponential backoff up to the attempt budget; fatal
/// failures surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, call_timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.attempts {
                        return Err(err);
                    }
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
