//! Hooks that run around job saves.
//!
//! Election filters may still change a job's next state before it is saved;
//! applied filters observe jobs after a successful save.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use jobweave_core::{Job, JobState};

use crate::retry::RetryPolicy;

pub trait JobFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called before a save for jobs that gained new states since the last save.
    fn on_state_election(&self, _job: &mut Job, _now: DateTime<Utc>) {}

    /// Called after a job has been durably saved.
    fn on_state_applied(&self, _job: &Job) {}
}

/// Reschedules retryable failures with backoff.
///
/// A job whose newest state is a retryable FAILED and that has failed at most
/// `max_attempts` times is moved to SCHEDULED with reason `Retry N of M`.
#[derive(Debug, Clone, Default)]
pub struct RetryFilter {
    policy: RetryPolicy,
}

impl RetryFilter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl JobFilter for RetryFilter {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn on_state_election(&self, job: &mut Job, now: DateTime<Utc>) {
        if !matches!(job.state(), JobState::Failed { retryable: true, .. }) {
            return;
        }
        let failures = job.failure_count();
        if !self.policy.should_retry(failures) {
            debug!(job_id = ?job.id(), failures, "retries exhausted");
            return;
        }

        let attempt = u32::try_from(failures).unwrap_or(u32::MAX);
        let delay = self.policy.delay_for_attempt(attempt);
        let at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        let reason = format!("Retry {attempt} of {}", self.policy.max_attempts);
        if let Err(e) = job.schedule_at(at, reason, now) {
            warn!(job_id = ?job.id(), error = %e, "could not schedule retry");
        }
    }
}

/// Logs every applied state change at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateChangeLogger;

impl JobFilter for StateChangeLogger {
    fn name(&self) -> &'static str {
        "state-change-logger"
    }

    fn on_state_applied(&self, job: &Job) {
        debug!(
            job_id = ?job.id(),
            job = %job.name(),
            state = %job.state_name(),
            version = job.version(),
            "job state applied"
        );
    }
}

/// Ordered set of filters.
#[derive(Clone, Default)]
pub struct JobFilters {
    filters: Vec<Arc<dyn JobFilter>>,
}

impl JobFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry plus state logging.
    pub fn standard(retry: RetryPolicy) -> Self {
        Self::new()
            .with(RetryFilter::new(retry))
            .with(StateChangeLogger)
    }

    pub fn with(mut self, filter: impl JobFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run election filters on every job with unsaved state changes.
    pub fn elect(&self, jobs: &mut [Job], now: DateTime<Utc>) {
        for job in jobs.iter_mut().filter(|j| j.has_unsaved_state_changes()) {
            for filter in &self.filters {
                filter.on_state_election(job, now);
            }
        }
    }

    pub fn applied(&self, job: &Job) {
        for filter in &self.filters {
            filter.on_state_applied(job);
        }
    }
}

impl core::fmt::Debug for JobFilters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<_> = self.filters.iter().map(|x| x.name()).collect();
        f.debug_struct("JobFilters").field("filters", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobweave_core::{JobDetail, ServerId, StateName};
    use std::time::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn failed(retryable: bool) -> Job {
        let mut job = Job::enqueued(JobDetail::handler("noop"), t(0));
        job.start_processing(ServerId::new(), t(1)).unwrap();
        job.fail("boom", "boom", retryable, t(2)).unwrap();
        job
    }

    #[test]
    fn retryable_failure_is_rescheduled_with_backoff() {
        let filters = JobFilters::standard(RetryPolicy::fixed(3, Duration::from_secs(30)));
        let mut jobs = vec![failed(true)];

        filters.elect(&mut jobs, t(2));

        assert_eq!(jobs[0].state_name(), StateName::Scheduled);
        assert_eq!(jobs[0].scheduled_at(), Some(t(32)));
        assert!(matches!(
            jobs[0].state(),
            JobState::Scheduled { reason: Some(r), .. } if r == "Retry 1 of 3"
        ));
    }

    #[test]
    fn non_retryable_failure_stays_failed() {
        let filters = JobFilters::standard(RetryPolicy::default());
        let mut jobs = vec![failed(false)];

        filters.elect(&mut jobs, t(2));

        assert_eq!(jobs[0].state_name(), StateName::Failed);
    }

    #[test]
    fn exhausted_retries_stay_failed() {
        let filters = JobFilters::standard(RetryPolicy::no_retry());
        let mut jobs = vec![failed(true)];

        filters.elect(&mut jobs, t(2));

        assert_eq!(jobs[0].state_name(), StateName::Failed);
    }

    #[test]
    fn saved_jobs_are_not_elected_again() {
        let filters = JobFilters::standard(RetryPolicy::default());
        let mut jobs = vec![failed(true)];
        jobs[0].mark_saved();

        filters.elect(&mut jobs, t(2));

        assert_eq!(jobs[0].state_name(), StateName::Failed);
    }
}
