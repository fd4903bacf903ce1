// Reconnect backoff: capped exponential delay with jitter

use crate::config::ReconnectSettings;
use std::time::Duration;

/// Exponential reconnect schedule: initial, 2x, 4x, ... up to `max_delay`,
/// each delay spread by ±`jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts in one window before LinkLost is reported
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(ReconnectSettings::default())
    }
}

impl From<ReconnectSettings> for ReconnectPolicy {
    fn from(settings: ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before attempt `attempt` (0-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay before attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        use rand::Rng;
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Is another attempt allowed in the current window?
    pub fn should_retry(&self, attempts_in_window: u32) -> bool {
        attempts_in_window < self.max_attempts
    }
}
