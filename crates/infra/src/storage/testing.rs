//! Store wrapper that injects failures and races for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobweave_core::{Job, JobId, RecurringJob, StateName};

use super::{InMemoryStorageProvider, JobOrder, Metadata, StorageError, StorageProvider};

#[derive(Debug, Default)]
pub(crate) struct ScriptedStore {
    pub inner: InMemoryStorageProvider,
    /// `fetch_scheduled_due` fails like a dropped connection.
    pub fail_scheduled_fetch: AtomicBool,
    /// Jobs read through `fetch_jobs` are deleted by a competing server
    /// right after the read.
    pub race_deletes: AtomicBool,
    /// Jobs read through `fetch_scheduled_due` are re-saved unchanged by a
    /// competing server right after the read, bumping their version.
    pub race_resaves: AtomicBool,
    /// Calls to `fetch_scheduled_due`.
    pub scheduled_fetches: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for ScriptedStore {
    async fn save(&self, jobs: &mut [Job]) -> Result<(), StorageError> {
        self.inner.save(jobs).await
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        self.inner.fetch_job(id).await
    }

    async fn fetch_scheduled_due(
        &self,
        upto: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        self.scheduled_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_scheduled_fetch.load(Ordering::SeqCst) {
            return Err(StorageError::Storage("connection refused".into()));
        }
        let jobs = self.inner.fetch_scheduled_due(upto, limit).await?;
        if self.race_resaves.load(Ordering::SeqCst) && !jobs.is_empty() {
            let mut theirs = jobs.clone();
            for job in theirs.iter_mut() {
                job.increase_version();
            }
            self.inner.save(&mut theirs).await?;
        }
        Ok(jobs)
    }

    async fn fetch_jobs(
        &self,
        state: StateName,
        updated_before: Option<DateTime<Utc>>,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self
            .inner
            .fetch_jobs(state, updated_before, order, limit)
            .await?;
        if self.race_deletes.load(Ordering::SeqCst) && !jobs.is_empty() {
            let mut theirs = jobs.clone();
            for job in theirs.iter_mut() {
                let at = job.updated_at();
                job.delete("deleted by another server", at)
                    .map_err(|e| StorageError::Storage(e.to_string()))?;
                job.increase_version();
            }
            self.inner.save(&mut theirs).await?;
        }
        Ok(jobs)
    }

    async fn delete_permanently(
        &self,
        state: StateName,
        older_than: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        self.inner.delete_permanently(state, older_than).await
    }

    async fn count_jobs(&self, state: StateName) -> Result<usize, StorageError> {
        self.inner.count_jobs(state).await
    }

    async fn recurring_job_instances(
        &self,
        recurring_job_id: &str,
        states: &[StateName],
    ) -> Result<Vec<Job>, StorageError> {
        self.inner
            .recurring_job_instances(recurring_job_id, states)
            .await
    }

    async fn save_recurring_job(&self, job: RecurringJob) -> Result<(), StorageError> {
        self.inner.save_recurring_job(job).await
    }

    async fn fetch_recurring_jobs(&self) -> Result<Vec<RecurringJob>, StorageError> {
        self.inner.fetch_recurring_jobs().await
    }

    async fn delete_recurring_job(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete_recurring_job(id).await
    }

    async fn recurring_jobs_checksum(&self) -> Result<u64, StorageError> {
        self.inner.recurring_jobs_checksum().await
    }

    async fn save_metadata(&self, metadata: Metadata) -> Result<(), StorageError> {
        self.inner.save_metadata(metadata).await
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        owner: &str,
    ) -> Result<Option<Metadata>, StorageError> {
        self.inner.fetch_metadata(name, owner).await
    }

    async fn delete_metadata(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        self.inner.delete_metadata(name, owner).await
    }
}
