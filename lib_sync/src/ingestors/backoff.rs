//! Reconnect delay policy and jitter helper.

use std::time::Duration;

use rand::Rng;

use crate::configs::TransportConfig;

/// Exponential reconnect schedule with a cap and a retry budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect.
    pub base: Duration,
    /// Upper bound for any delay before jitter.
    pub cap: Duration,
    /// Reconnects allowed before giving up.
    pub max_attempts: u32,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl ReconnectPolicy {
    /// Builds the policy from transport settings.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_delay_ms),
            cap: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.max_reconnect_attempts,
            jitter_ratio: config.reconnect_jitter_ratio,
        }
    }

    /// `min(base * 2^(attempt-1), cap)` for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }

    /// [`base_delay`](Self::base_delay) plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        add_jitter(self.base_delay(attempt), self.jitter_ratio)
    }

    /// True once `attempt` is past the retry budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Adds a uniformly random extra delay in `[0, ratio * duration]`.
pub fn add_jitter(duration: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || duration.is_zero() {
        return duration;
    }
    let max_extra = duration.as_secs_f64() * ratio.min(1.0);
    let extra = rand::rng().random_range(0.0..=max_extra);
    duration + Duration::from_secs_f64(extra)
}
