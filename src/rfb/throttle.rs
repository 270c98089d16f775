//! Consumer-side frame pacing.

use std::time::{Duration, Instant};

/// Emits at most once per `interval`, and only when a newer frame exists.
///
/// `generation` is the count of decoded updates; the decode loop bumps it,
/// the consumer passes the current value to [`FrameThrottle::should_emit`].
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_generation: u64,
}

impl FrameThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_generation: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` (and records the emission) if a frame should be handed
    /// to the consumer now.
    pub fn should_emit(&mut self, now: Instant, generation: u64) -> bool {
        if generation <= self.last_generation {
            return false;
        }
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_emit = Some(now);
        self.last_generation = generation;
        true
    }
}
