//! Supervisor wait between cycles: doubled on every failed cycle, capped,
//! and reset by the first successful one.

use std::time::Duration;

/// # Cycle Backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Starts at `base`; `max` is raised to `base` if smaller.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// The wait applied after the current cycle.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// True once the wait has been raised above its base.
    pub fn is_backing_off(&self) -> bool {
        self.current > self.base
    }

    /// Doubles the wait, up to the cap, and returns it.
    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    /// Returns to the base wait.
    pub fn on_success(&mut self) {
        self.current = self.base;
    }
}
