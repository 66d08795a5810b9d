//! Reconnect delay policy.
//!
//! `delay(n) = min(base * 2^n, max) + jitter`, where the jitter is a random
//! fraction of the capped delay so a fleet of clients does not reconnect in
//! lockstep after a server restart.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the added jitter, as a fraction of the capped delay.
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic part of the delay for the given attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full delay including jitter.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter_ratio <= 0.0 {
            return backoff;
        }
        let jitter = backoff.mul_f64(rng.gen_range(0.0..self.jitter_ratio));
        backoff + jitter
    }
}
