use std::time::Duration;

use rand::Rng;

/// Retry budget with exponential backoff and random jitter.
///
/// `max_retries` counts retries after the initial attempt, so the default of
/// 3 allows four attempts in total. Delay for retry `n` (0-indexed) is
/// `min(base * multiplier^n, max_delay) + jitter`; jitter spreads
/// simultaneous failures so they do not hammer the origin in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// True while the retry budget allows another attempt.
    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Backoff before retry number `retry` (0-indexed).
    pub fn next_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exp_ms = base_ms * self.multiplier.powi(retry as i32);
        let capped_ms = exp_ms.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(capped_ms) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max))
    }
}
