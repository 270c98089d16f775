//! Reconnect pacing for RFB clients.
//!
//! Plain state advanced by explicit timestamps, so hosts can keep one per
//! screen and tests can drive it without sleeping.

use std::time::{Duration, Instant};

/// Capped exponential backoff: `base`, `2*base`, `4*base`, ... up to `max`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
            last_attempt: None,
        }
    }

    /// Failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait required after the most recent failed attempt.
    pub fn current_delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(self.attempts - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Time left before the next attempt is allowed.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_attempt {
            Some(last) => self
                .current_delay()
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}
