//! Bounded retry with exponential backoff for opening completion streams.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::warn;

use crate::error::{Error, Result};
use crate::observability::{CLIENT_REQUEST_RETRIES, CLIENT_RETRY_BACKOFF};

/// How often and how patiently to retry a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// The delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
///
/// A `retry_after` hint on the error takes precedence over the computed
/// backoff, clamped to the policy's maximum.
pub async fn retry_with_backoff<F, Fut, T>(policy: RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let never = AtomicBool::new(false);
    retry_with_backoff_until(policy, &never, operation).await
}

/// Like [`retry_with_backoff`], but gives up with an abort error as soon as
/// `interrupted` is set, including in the middle of a backoff delay.
pub async fn retry_with_backoff_until<F, Fut, T>(
    policy: RetryPolicy,
    interrupted: &AtomicBool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        check_interrupt(interrupted)?;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = err
                    .retry_after()
                    .map(Duration::from_secs)
                    .map(|hint| hint.min(policy.max_backoff))
                    .unwrap_or_else(|| policy.backoff(attempt));
                warn!(
                    "Request failed (attempt {}/{}): {err}. Retrying after {:?}...",
                    attempt, max_attempts, delay
                );
                CLIENT_REQUEST_RETRIES.click();
                CLIENT_RETRY_BACKOFF.add(delay.as_secs_f64());
                interruptible_sleep(delay, interrupted).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn check_interrupt(interrupted: &AtomicBool) -> Result<()> {
    if interrupted.load(Ordering::SeqCst) {
        Err(Error::abort("request interrupted during retry"))
    } else {
        Ok(())
    }
}

async fn interruptible_sleep(delay: Duration, interrupted: &AtomicBool) -> Result<()> {
    let deadline = Instant::now() + delay;
    loop {
        check_interrupt(interrupted)?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        sleep((deadline - now).min(INTERRUPT_POLL)).await;
    }
}
