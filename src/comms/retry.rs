use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between redeliveries grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * multiplier^n`
    #[default]
    Exponential,
    /// `base * n`
    Linear,
    /// `base`
    Fixed,
}

/// Redelivery schedule for unacknowledged or faulted deliveries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before redelivery attempt `attempt` (1-based), capped at `max_delay`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = match self.strategy {
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let scaled = base_ms as f64 * self.multiplier.max(1.0).powi(exponent);
                if scaled.is_finite() && scaled < max_ms as f64 {
                    scaled.round() as u64
                } else {
                    max_ms
                }
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Fixed => base_ms,
        };
        Duration::from_millis(delay_ms.min(max_ms))
    }

    /// Whether another redelivery is allowed after `attempts_made` redeliveries.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
