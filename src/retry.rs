use crate::config::types::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff policy for transient failures
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: usize,
    pub initial: Duration,
    pub max: Duration,
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: config.initial_backoff,
            max: config.max_backoff,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = std::cmp::min(delay * 2, self.max);
        }
        delay
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Errors for which `is_transient` returns false are returned immediately.
    /// After the last attempt the final error is returned unchanged.
    pub async fn retry<F, Fut, T, E>(
        &self,
        what: &str,
        mut operation: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempts = 0;
        let mut backoff = self.initial;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    if !is_transient(&e) {
                        return Err(e);
                    }
                    if attempts >= self.max_attempts {
                        tracing::error!(
                            operation = what,
                            attempts = attempts,
                            error = %e,
                            "Max retries exceeded"
                        );
                        return Err(e);
                    }

                    tracing::warn!(
                        operation = what,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.max);
                }
            }
        }
    }
}
