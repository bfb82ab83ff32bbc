use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Detects host sleeps from the wall-clock gap between loop cycles.
///
/// The loop observes every cycle start; workers finishing a job between
/// cycles read the verdict of the latest one so their saves resolve
/// conflicts the same way the loop does.
#[derive(Debug)]
pub struct SleepDetector {
    threshold: chrono::Duration,
    last_cycle: Mutex<Option<DateTime<Utc>>>,
    slept: AtomicBool,
}

impl SleepDetector {
    /// A gap longer than twice `poll_interval` counts as a sleep.
    pub fn new(poll_interval: Duration) -> Self {
        let poll = chrono::Duration::from_std(poll_interval).unwrap_or(chrono::Duration::MAX);
        Self {
            threshold: poll.checked_mul(2).unwrap_or(chrono::Duration::MAX),
            last_cycle: Mutex::new(None),
            slept: AtomicBool::new(false),
        }
    }

    /// Record a cycle starting at `now`; returns whether the host slept
    /// since the previous one.
    pub fn observe(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.last_cycle.lock().unwrap_or_else(|e| e.into_inner());
        let slept = last.is_some_and(|prev| now - prev > self.threshold);
        *last = Some(now);
        self.slept.store(slept, Ordering::SeqCst);
        slept
    }

    /// Verdict of the most recent cycle.
    pub fn system_slept(&self) -> bool {
        self.slept.load(Ordering::SeqCst)
    }

    pub fn last_cycle(&self) -> Option<DateTime<Utc>> {
        *self.last_cycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn gap_must_exceed_twice_the_poll_interval() {
        let detector = SleepDetector::new(Duration::from_secs(5));

        assert!(!detector.observe(t(0)));
        assert!(!detector.observe(t(10)));
        assert!(!detector.system_slept());

        assert!(detector.observe(t(21)));
        assert!(detector.system_slept());
        assert_eq!(detector.last_cycle(), Some(t(21)));

        // The verdict only holds until the next cycle.
        assert!(!detector.observe(t(26)));
        assert!(!detector.system_slept());
    }
}
