// ===============================
// src/retry.rs
// ===============================
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ExchangeError, ExchangeResult};
use crate::metrics::EXCHANGE_RETRIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry with the stretched rate-limit wait.
    RateLimit,
    Retry,
    /// Surface immediately.
    Fatal,
}

pub fn default_classifier(e: &ExchangeError) -> RetryClass {
    if e.is_rate_limit() {
        RetryClass::RateLimit
    } else if e.is_retryable() {
        RetryClass::Retry
    } else {
        RetryClass::Fatal
    }
}

/// Exponential backoff shared by every exchange call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub rate_limit_factor: u32,
    pub classify: fn(&ExchangeError) -> RetryClass,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            rate_limit_factor: 4,
            classify: default_classifier,
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt given the current backoff.
    pub fn wait_for(&self, class: RetryClass, backoff: Duration) -> Duration {
        match class {
            RetryClass::RateLimit => (backoff * self.rate_limit_factor).min(self.max),
            _ => backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, token: &CancellationToken, op: &str, mut f: F) -> ExchangeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let mut backoff = self.base;
        let mut attempt = 1u32;
        loop {
            if token.is_cancelled() {
                return Err(ExchangeError::Cancelled);
            }
            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let class = (self.classify)(&err);
            if class == RetryClass::Fatal || attempt >= self.attempts {
                return Err(err);
            }
            let wait = self.wait_for(class, backoff);
            EXCHANGE_RETRIES.with_label_values(&[err.class()]).inc();
            warn!(op, attempt, wait_ms = wait.as_millis() as u64, error = %err, "exchange call failed, retrying");
            tokio::select! {
                _ = token.cancelled() => return Err(ExchangeError::Cancelled),
                _ = sleep(wait) => {}
            }
            backoff = (backoff * 2).min(self.max);
            attempt += 1;
        }
    }
}
