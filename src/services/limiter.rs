//! Fixed-window throttle for credential submissions.

use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub struct AttemptLimiter {
    window: Duration,
    max_attempts: u32,
    count: u32,
    window_start: Instant,
}

impl AttemptLimiter {
    pub fn new(window: Duration, max_attempts: u32, now: Instant) -> Self {
        Self {
            window,
            max_attempts,
            count: 0,
            window_start: now,
        }
    }

    /// Whether another attempt fits into the current window.
    ///
    /// Opens a fresh window once the current one has fully elapsed.
    pub fn allow(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.count = 0;
            self.window_start = now;
            return true;
        }

        self.count < self.max_attempts
    }

    /// Count an attempt. The counter saturates at the ceiling.
    pub fn record_attempt(&mut self, now: Instant) {
        if self.count == 0 {
            self.window_start = now;
        }

        if self.count < self.max_attempts {
            self.count += 1;
        }
    }

    /// Time until the current window closes.
    pub fn retry_after(&self, now: Instant) -> Duration {
        self.window
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
