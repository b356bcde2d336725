//! Bounded retries, processor backoff and time-aligned poll intervals

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;

/// Largest shift applied when doubling retry delays
const MAX_BACKOFF_SHIFT: u32 = 16;
/// Upper bound of the random jitter added to processor backoff
const BACKOFF_JITTER_MS: u64 = 1_000;

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry; doubled for each further retry
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub const fn new(retries: u32, initial_backoff: Duration) -> Self {
        Self {
            retries,
            initial_backoff,
        }
    }

    /// Delay after the `failed`-th failure (1-based)
    pub fn delay_for(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.initial_backoff.saturating_mul(1 << shift)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the zero-based attempt number. The last error is returned
/// once all retries fail. A stop request cuts the remaining backoff short.
pub async fn retry_up_to<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 0;
    loop {
        match op(attempts).await {
            Ok(value) => return Ok(value),
            Err(e) if attempts < policy.retries => {
                attempts += 1;
                let backoff = policy.delay_for(attempts);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    label,
                    attempts,
                    policy.retries + 1,
                    backoff.as_millis(),
                    e
                );
                if !cancel.sleep(backoff).await {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like [`retry_up_to`], but logs the final failure and yields `None`
pub async fn retry_up_to_and_continue<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    op: F,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    match retry_up_to(policy, cancel, label, op).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("{} failed after {} attempts: {}", label, policy.retries + 1, e);
            None
        }
    }
}

/// Exponential backoff for unexpected processor errors
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Start at `base`, never exceed `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Next delay; doubles each call and adds up to a second of jitter
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(MAX_BACKOFF_SHIFT);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS));
        self.base
            .saturating_mul(1 << shift)
            .saturating_add(jitter)
            .min(self.max)
    }

    /// Back to the base delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Time until the next multiple of `interval` after `now_ms` (unix millis).
///
/// Naps end on fixed wall-clock boundaries so their length does not depend
/// on how long the preceding pass took. With `jitter` the result is scaled
/// by a random factor in `[0.75, 1.25)`.
pub fn aligned_poll_delay(now_ms: i64, interval: Duration, jitter: bool) -> Duration {
    let interval_ms = (interval.as_millis() as u64).max(1);
    let now = now_ms.max(0) as u64;
    let delta = interval_ms - (now % interval_ms);
    if jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.75..1.25);
        Duration::from_millis((delta as f64 * factor) as u64)
    } else {
        Duration::from_millis(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let result: Result<u32, String> =
            retry_up_to(policy, &CancelToken::new(), "op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(format!("attempt {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let result: Option<()> =
            retry_up_to_and_continue(policy, &CancelToken::new(), "op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("boom") }
            })
            .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> =
            retry_up_to(RetryPolicy::new(5, Duration::from_secs(1)), &cancel, "op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs(5) && first < Duration::from_secs(6));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_aligned_poll_delay() {
        let interval = Duration::from_secs(20);
        assert_eq!(
            aligned_poll_delay(1_000_005_000, interval, false),
            Duration::from_millis(15_000)
        );
        // exactly on a boundary waits a full interval
        assert_eq!(aligned_poll_delay(40_000, interval, false), interval);

        for _ in 0..50 {
            let delay = aligned_poll_delay(1_000_005_000, interval, true);
            assert!(delay >= Duration::from_millis(11_250));
            assert!(delay < Duration::from_millis(18_750));
        }
    }
}
