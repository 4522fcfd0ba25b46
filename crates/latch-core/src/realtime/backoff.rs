//! Reconnect backoff.

use std::time::Duration;

use crate::config::RealtimeConfig;

/// Exponential delay parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay for attempt 0.
    pub base: Duration,
    /// Upper bound.
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

impl From<&RealtimeConfig> for Backoff {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

impl Backoff {
    /// `min(cap, base * 2^attempt)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Retry bookkeeping for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Retries scheduled since the last successful open.
    pub attempt: u32,
}

impl ReconnectState {
    /// Delay for the next retry, then count it.
    pub fn schedule(&mut self, backoff: &Backoff) -> Duration {
        let delay = backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Delay for `attempt` with the default 1 s base and 30 s cap.
#[must_use]
pub fn delay(attempt: u32) -> Duration {
    Backoff::default().delay(attempt)
}
