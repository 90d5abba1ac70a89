//! Shared retry policy for snapshot fetches and enrichment lookups.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that can tell a transient failure from a terminal one.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 {
            let spread = capped_delay.saturating_mul(self.jitter_percent) / 100;
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }
}

pub enum Backoff {
    Fixed(Duration),
    Exponential(ExponentialBackoff),
}

impl Backoff {
    /// Delay to wait after the failed attempt numbered `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential(backoff) => backoff.delay(attempt),
        }
    }
}

/// Bounded retries with a backoff schedule. Terminal errors return at once.
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn exponential(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self::new(
            max_attempts,
            Backoff::Exponential(ExponentialBackoff::new(base_ms, max_ms)),
        )
    }

    /// Single attempt, no waiting. Used by tests and one-shot tools.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay
                    );
                    attempt += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(bool);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transient={}", self.0)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(100, 10000).with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn test_max_cap() {
        let backoff = ExponentialBackoff::new(100, 1000).with_jitter(0);
        assert!(backoff.delay(10).as_millis() <= 1000);
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let backoff = ExponentialBackoff::new(100, 1000).with_jitter(10);
        for _ in 0..50 {
            let delay = backoff.delay(0).as_millis();
            assert!((100..=110).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<u32, TestError> = policy
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError(true))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<(), TestError> = policy
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(true))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let result: Result<(), TestError> = policy
            .run("missing", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(false))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_backoff_waits_between_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let result: Result<(), TestError> = policy
            .run("slow", || async { Err(TestError(true)) })
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
