use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;

/// Exponential backoff for batch tagging attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    limit: usize,
    base_delay_ms: u64,
}

impl RetryPolicy {
    /// `limit` is the total number of attempts, clamped to at least one.
    #[must_use]
    pub fn new(limit: usize, base_delay: Duration) -> Self {
        let base = u64::try_from(base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            limit: limit.max(1),
            base_delay_ms: base,
        }
    }

    /// A policy that tries once and never waits.
    #[must_use]
    pub fn none() -> Self {
        Self {
            limit: 1,
            base_delay_ms: 1,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.limit
    }

    /// Backoff after the given failed attempt (1-based). Doubles per attempt
    /// with the exponent capped so the shift cannot overflow.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(backoff.max(self.base_delay_ms))
    }

    fn jitter(&self) -> Duration {
        Duration::from_millis(rand::rng().random_range(0..=self.base_delay_ms))
    }

    /// Run `op` until it succeeds or the attempt limit is reached. The last
    /// error wins.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.limit {
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt) + self.jitter();
                    tracing::warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Trips after a run of consecutive batch failures so a dead service does
/// not burn through the remaining work.
#[derive(Debug)]
pub struct CircuitBreaker {
    trip_after: usize,
    consecutive: AtomicUsize,
}

impl CircuitBreaker {
    /// A `trip_after` of zero disables the breaker.
    #[must_use]
    pub fn new(trip_after: usize) -> Self {
        Self {
            trip_after,
            consecutive: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.trip_after > 0 && self.consecutive.load(Ordering::Relaxed) >= self.trip_after
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&self) -> usize {
        self.consecutive.fetch_add(1, Ordering::Relaxed) + 1
    }
}
