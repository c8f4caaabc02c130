//! Transaction retry on write conflicts
//!
//! Same-user writers serialize on row locks, but a racing insert can still trip the
//! one-active-record index or Postgres can abort a transaction as a deadlock victim.
//! Those failures are transient: every core operation recomputes its end state from
//! the rows it reads, so running the whole transaction again is safe.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_delay_ms.max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or retries run out
pub async fn with_conflict_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    let result = RetryIf::start(policy.delays(), &mut op, |err: &BillingError| {
        let retry = err.is_retryable();
        if retry {
            tracing::warn!(operation, error = %err, "Write conflict, retrying transaction");
        }
        retry
    })
    .await;

    if let Err(err) = &result {
        if err.is_retryable() {
            tracing::error!(
                operation,
                max_retries = policy.max_retries,
                error = %err,
                "Write conflict persisted after retries"
            );
        }
    }
    result
}
