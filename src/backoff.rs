//! Growing poll interval for the barrier and request waits.

use std::time::Duration;

/// Poll interval that doubles after every poll, up to a ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Starts at `initial` and never exceeds `max`.
    ///
    /// A `max` below `initial` is raised to `initial`, which makes the
    /// interval fixed.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the interval, capped at the ceiling.
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Sleeps for the current interval, then advances it.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.next();
    }
}
