//! Deadline for the provisioning phase.

use std::time::{Duration, Instant};

pub const DEFAULT_BUDGET: Duration = Duration::from_secs(10 * 60);

/// Fixed budget measured from the moment setup began. Never paused or
/// extended within a boot cycle.
#[derive(Clone, Copy, Debug)]
pub struct ProvisioningWindow {
    start: Instant,
    budget: Duration,
}

impl ProvisioningWindow {
    pub fn start(now: Instant, budget: Duration) -> Self {
        Self { start: now, budget }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.budget
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.budget.saturating_sub(self.elapsed(now))
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}
