// ===============================
// src/retry.rs
// ===============================
use std::fmt::Display;
use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

#[derive(Debug, Clone)]
pub enum Backoff {
    Fixed(Duration),
    /// base * 2^attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// Bounded-backoff retry. `max_attempts = None` retries until the call succeeds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self { max_attempts, backoff: Backoff::Fixed(delay), jitter_ms: 0 }
    }

    pub fn exponential(base: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self { max_attempts, backoff: Backoff::Exponential { base, max }, jitter_ms: 250 }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match &self.backoff {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(*max)
            }
        };
        if self.jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
        }
    }

    /// Runs `op` until it returns `Ok` or the attempt budget is spent; the last
    /// error is returned in that case. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!(%e, attempt, what, "giving up");
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(%e, attempt, what, delay_ms = delay.as_millis() as u64, "retrying");
                    sleep(delay).await;
                }
            }
        }
    }
}
