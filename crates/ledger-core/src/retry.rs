//! Retry wrapper for the payment engine's units of work (spec §4.3.5):
//! re-runs the *entire* unit of work — reads, writes, and commit — on a
//! serialization failure or deadlock (SQLSTATE 40001 / 40P01), never just
//! the final commit step. Exponential back-off with jitter, bounded
//! attempts and bounded maximum delay.

use crate::error::{LedgerError, LedgerResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jitter)
    }
}

/// Runs `unit_of_work` up to `policy.max_attempts` times, retrying only on
/// a retryable database error. Non-retryable failures (including any
/// invariant violation, which is a business-logic abort, not a storage
/// race) propagate on the first attempt.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut unit_of_work: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    loop {
        match unit_of_work().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable_db_error() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    pgcode = ?err.pgcode(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying unit of work after serialization/deadlock error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Same contract as [`with_retry`], but intended for callers who already
/// own an outer transaction (the "don't commit" mode of §4.3.5): the unit
/// of work is expected to use a nested savepoint internally rather than a
/// session rollback, so retrying here never invalidates the caller's
/// surrounding transaction.
pub async fn with_retry_in_savepoint<T, F, Fut>(policy: RetryPolicy, unit_of_work: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    with_retry(policy, unit_of_work).await
}

pub fn is_permanent_failure(err: &LedgerError) -> bool {
    !err.is_retryable_db_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 1, 5);
        let result = with_retry(policy, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(LedgerError::Invalid {
                    message: "not actually retryable".into(),
                    details: json!({}),
                })
            } else {
                Ok(42)
            }
        })
        .await;
        // Non-retryable errors should NOT be retried: bail immediately.
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_first_try_without_delay() {
        let policy = RetryPolicy::new(3, 10, 100);
        let result: LedgerResult<i32> = with_retry(policy, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
