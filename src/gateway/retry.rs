use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::ExchangeError;

/// Exponential backoff retry policy for exchange calls.
///
/// Delay before attempt `n+1` is `min(max_delay, initial * base^(n-1))`,
/// perturbed by up to `jitter` (a fraction of the delay) in either direction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub base: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            base: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No-retry policy, used where a single attempt is wanted.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Deterministic delay for the given 1-based attempt number, without
    /// jitter. Non-decreasing up to `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// `delay(attempt)` with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let range = base * self.jitter;
        let offset = rand::thread_rng().gen_range(-range..=range);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Run `operation` up to `max_attempts` times, sleeping a backoff delay
    /// between attempts. Stops immediately on a non-retryable failure or on
    /// a retryable one `permit_retry` refuses, re-raising the last error.
    pub async fn run<T, F, Fut, P>(
        &self,
        mut operation: F,
        permit_retry: P,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
        P: Fn(&ExchangeError) -> bool,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || !permit_retry(&err) || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.jittered_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
