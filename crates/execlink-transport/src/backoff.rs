//! Exponential backoff for reconnection.

use std::time::Duration;

use execlink_core::ReconnectConfig;

/// Largest exponent applied to the base delay.
const MAX_EXPONENT: u32 = 8;

/// Delay before retry number `attempt` (zero based):
/// `base * 2^min(attempt, 8)`, capped at `max`.
#[must_use]
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(MAX_EXPONENT);
    base.saturating_mul(factor).min(max)
}

/// Reconnect policy derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy from configuration.
    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay,
            max_attempts: config.max_attempts,
        }
    }

    /// Maximum number of automatic retries.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay for retry `attempt`, or `None` once the budget is spent.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| reconnect_delay(attempt, self.base, self.max))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
