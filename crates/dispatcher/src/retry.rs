//! Per-event retry policy

use std::time::Duration;

use contracts::RetryConfig;
use rand::Rng;

/// Exponential backoff with jitter and a per-sink attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized in both directions
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// True once `attempts` calls have used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::rng())
    }

    pub fn backoff_with<G: Rng + ?Sized>(&self, attempt: u32, rng: &mut G) -> Duration {
        calculate_backoff(
            attempt,
            self.base_delay,
            self.max_delay,
            self.jitter,
            rng.random::<f64>(),
        )
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::from_config(config)
    }
}

/// `min(cap, base * 2^(attempt-1))` shifted by up to `±jitter` of itself,
/// never above `cap`. `unit` is a sample from `[0, 1)`.
pub fn calculate_backoff(
    attempt: u32,
    base: Duration,
    cap: Duration,
    jitter: f64,
    unit: f64,
) -> Duration {
    let exp = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    let capped = base_ms.saturating_mul(exp).min(cap_ms) as f64;

    let offset = (unit.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter * capped;
    let with_jitter = (capped + offset).clamp(0.0, cap_ms as f64);
    Duration::from_millis(with_jitter.round() as u64)
}
