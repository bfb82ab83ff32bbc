use std::time::Duration;

use tokio::time::Instant;

/// Deadline a maintenance task checks before fetching its next page.
#[derive(Debug, Clone, Copy)]
pub struct TimeBox {
    deadline: Instant,
}

impl TimeBox {
    /// `ratio` of whatever is left until `cycle_deadline`, starting now.
    pub fn within(cycle_deadline: Instant, ratio: f64) -> Self {
        let now = Instant::now();
        let remaining = cycle_deadline.saturating_duration_since(now);
        Self {
            deadline: now + remaining.mul_f64(ratio.clamp(0.0, 1.0)),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
