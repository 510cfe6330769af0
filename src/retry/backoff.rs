use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with additive jitter.
///
/// delay = min(base * 2^(attempt - 1), cap) + uniform(0, jitter_ratio * that)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 60_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.1,
        }
    }
}

impl Backoff {
    /// Capped exponential delay for `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Delay for `attempt` with jitter drawn from `rng`. Jitter is only ever
    /// added, so the result is never below [`Backoff::base_delay`].
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let spread = (base.as_millis() as f64 * self.jitter_ratio.max(0.0)) as u64;
        let jitter = if spread == 0 { 0 } else { rng.gen_range(0..=spread) };
        base + Duration::from_millis(jitter)
    }
}
