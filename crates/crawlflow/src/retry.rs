use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub base_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1_000)
    }
}

impl Backoff {
    pub const fn fixed(base_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_ms,
        }
    }

    pub const fn exponential(base_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_ms,
        }
    }

    /// Delay before retry number `attempt_index + 1` (index 0 is the first retry).
    pub fn delay(&self, attempt_index: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.base_ms,
            BackoffKind::Exponential => {
                // 2^exp saturates well before u64 overflow matters
                let pow2 = 1_u64.checked_shl(attempt_index.min(40)).unwrap_or(u64::MAX);
                self.base_ms.saturating_mul(pow2)
            }
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            max_delay: Duration::from_secs(15 * 60),
        }
    }

    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        self.backoff.delay(attempt_index).min(self.max_delay)
    }
}

/// Spreads `delay` by up to `pct` either way so synchronized callers drift apart.
pub fn jittered(delay: Duration, pct: f64, rng: &mut impl Rng) -> Duration {
    let ms = delay.as_millis() as f64;
    let range = ms * pct.clamp(0.0, 1.0);
    if range < 1.0 {
        return delay;
    }
    let ms = (ms + rng.gen_range(-range..=range)).round().max(0.0);
    Duration::from_millis(ms as u64)
}

/// Runs `op` until it succeeds, `should_retry` refuses the error, or the
/// policy runs out of attempts. `op` receives the zero-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0_u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay = jittered(policy.delay_for(attempt - 1), 0.2, &mut rand::thread_rng());
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
