//! Bounded retry with a fixed delay, cut short by cancellation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CalendarError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, delay: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), delay }
    }

    /// Run `op` until it succeeds, `max_attempts` are used up, or `cancel`
    /// fires. Cancellation during the delay returns `Cancelled` at once.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(CalendarError::Cancelled);
            }
            tracing::debug!(attempt, "trying to {what}");

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(CalendarError::Cancelled) => return Err(CalendarError::Cancelled),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "failed to {what}");
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("{what}: cancelled while waiting to retry");
                        return Err(CalendarError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
        }

        Err(CalendarError::ConnectionExhausted { attempts: self.max_attempts, reason: last_error })
    }
}
