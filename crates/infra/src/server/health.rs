use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded { recent_failures: usize },
}

/// Rolling count of maintenance-task failures.
///
/// The server turns degraded once `threshold` failures fall inside `window`
/// and recovers when old failures age out.
#[derive(Debug, Clone)]
pub struct TaskHealth {
    window: chrono::Duration,
    threshold: usize,
    failures: VecDeque<DateTime<Utc>>,
    degraded: bool,
}

impl TaskHealth {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            threshold: threshold.max(1),
            failures: VecDeque::new(),
            degraded: false,
        }
    }

    /// Record a failure. Returns true if this failure made the server degraded.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        self.failures.push_back(now);
        let crossed = !self.degraded && self.failures.len() >= self.threshold;
        if crossed {
            self.degraded = true;
        }
        crossed
    }

    /// Age out old failures. Returns true if the server just recovered.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        let recovered = self.degraded && self.failures.len() < self.threshold;
        if recovered {
            self.degraded = false;
        }
        recovered
    }

    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    pub fn status(&self) -> HealthStatus {
        if self.degraded {
            HealthStatus::Degraded {
                recent_failures: self.failures.len(),
            }
        } else {
            HealthStatus::Healthy
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now.checked_sub_signed(self.window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        while self.failures.front().is_some_and(|at| *at <= cutoff) {
            self.failures.pop_front();
        }
    }
}
