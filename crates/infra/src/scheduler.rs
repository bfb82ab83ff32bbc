//! Client-side API for creating and deleting jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use jobweave_core::{
    Clock, Job, JobDetail, JobId, JobStateError, JobVersioner, RecurringJob, ScheduleError,
    StateName, SystemClock,
};

use crate::storage::{JobStats, StorageError, StorageProvider};

/// Attempts `delete` makes when the job keeps changing underneath it.
const DELETE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    State(#[from] JobStateError),

    #[error("job {0} kept changing; gave up deleting it")]
    DeleteContended(JobId),
}

/// Creates jobs in the shared store; no server needs to run in this process.
#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn StorageProvider>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub fn new(store: Arc<dyn StorageProvider>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enqueue a job for immediate processing.
    pub async fn enqueue(&self, detail: JobDetail) -> Result<JobId, SchedulerError> {
        self.submit(Job::enqueued(detail, self.clock.now())).await
    }

    /// Schedule a job to be enqueued at `at`.
    pub async fn schedule(
        &self,
        detail: JobDetail,
        at: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        self.submit(Job::scheduled(detail, at, self.clock.now())).await
    }

    /// Save a job built by the caller (name, priority, metadata...).
    pub async fn submit(&self, job: Job) -> Result<JobId, SchedulerError> {
        let mut batch = [job];
        self.store.save(&mut batch).await?;
        let [job] = batch;
        let id = job
            .id()
            .ok_or_else(|| StorageError::Storage("store did not assign a job id".into()))?;
        debug!(job_id = %id, state = %job.state_name(), "job created");
        Ok(id)
    }

    /// Move a job to DELETED, retrying when a server changes it concurrently.
    ///
    /// Returns false if the job does not exist or is already deleted.
    pub async fn delete(&self, id: JobId, reason: &str) -> Result<bool, SchedulerError> {
        for attempt in 1..=DELETE_ATTEMPTS {
            let Some(mut job) = self.store.fetch_job(id).await? else {
                return Ok(false);
            };
            if job.has_state(StateName::Deleted) {
                return Ok(false);
            }
            job.delete(reason, self.clock.now())?;

            let mut batch = [job];
            let mut versioner = JobVersioner::new(&mut batch);
            let result = self.store.save(&mut *versioner).await;
            match result {
                Ok(()) => {
                    versioner.commit_all();
                    info!(job_id = %id, reason, "job deleted");
                    return Ok(true);
                }
                Err(StorageError::ConcurrentModification { .. }) => {
                    debug!(job_id = %id, attempt, "job changed while deleting; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::DeleteContended(id))
    }

    /// Create or replace a recurring job. Returns its id.
    pub async fn create_recurring(&self, job: RecurringJob) -> Result<String, SchedulerError> {
        job.schedule.validate()?;
        // Rejects unknown zones and bad expressions before anything is stored.
        let _ = job.occurrences(job.created_at, job.created_at)?;
        let id = job.id.clone();
        self.store.save_recurring_job(job).await?;
        info!(recurring_job_id = %id, "recurring job saved");
        Ok(id)
    }

    pub async fn delete_recurring(&self, id: &str) -> Result<bool, SchedulerError> {
        let deleted = self.store.delete_recurring_job(id).await?;
        if deleted {
            info!(recurring_job_id = %id, "recurring job deleted");
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<JobStats, SchedulerError> {
        Ok(self.store.job_stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobweave_core::{ManualClock, Schedule, ServerId};

    use crate::storage::InMemoryStorageProvider;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn scheduler() -> (Arc<InMemoryStorageProvider>, JobScheduler) {
        let store = Arc::new(InMemoryStorageProvider::new());
        let scheduler =
            JobScheduler::new(store.clone()).with_clock(Arc::new(ManualClock::new(t(0))));
        (store, scheduler)
    }

    #[tokio::test]
    async fn enqueue_and_schedule_create_jobs() {
        let (store, scheduler) = scheduler();

        let now = scheduler.enqueue(JobDetail::handler("email.send")).await.unwrap();
        let later = scheduler
            .schedule(JobDetail::handler("report.build"), t(3600))
            .await
            .unwrap();

        let now = store.fetch_job(now).await.unwrap().unwrap();
        let later = store.fetch_job(later).await.unwrap().unwrap();
        assert_eq!(now.state_name(), StateName::Enqueued);
        assert_eq!(later.scheduled_at(), Some(t(3600)));

        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.scheduled, 1);
    }

    #[tokio::test]
    async fn delete_appends_to_the_latest_version() {
        let (store, scheduler) = scheduler();
        let id = scheduler.enqueue(JobDetail::handler("noop")).await.unwrap();

        let mut claimed = store.fetch_job(id).await.unwrap().unwrap();
        claimed.start_processing(ServerId::new(), t(1)).unwrap();
        claimed.increase_version();
        store.save(std::slice::from_mut(&mut claimed)).await.unwrap();

        assert!(scheduler.delete(id, "cancelled by user").await.unwrap());
        let job = store.fetch_job(id).await.unwrap().unwrap();
        assert_eq!(job.state_name(), StateName::Deleted);
        assert_eq!(job.version(), 2);

        assert!(!scheduler.delete(id, "again").await.unwrap());
        assert!(!scheduler.delete(JobId::new(), "missing").await.unwrap());
    }

    #[tokio::test]
    async fn recurring_jobs_are_validated_and_stored() {
        let (store, scheduler) = scheduler();
        let job = RecurringJob::new(
            JobDetail::handler("cleanup"),
            Schedule::cron("0 0 * * * *").unwrap(),
            t(0),
        )
        .unwrap();

        let id = scheduler.create_recurring(job).await.unwrap();
        assert_eq!(id, "cleanup()");
        assert_eq!(store.fetch_recurring_jobs().await.unwrap().len(), 1);

        assert!(scheduler.delete_recurring(&id).await.unwrap());
        assert!(!scheduler.delete_recurring(&id).await.unwrap());
    }
}
