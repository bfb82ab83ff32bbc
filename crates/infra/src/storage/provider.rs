use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use jobweave_core::{Job, JobId, RecurringJob, StateName};

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// One or more jobs were saved with a stale version (or no longer exist).
    ///
    /// Every other job in the batch was saved.
    #[error("concurrent modification of {} job(s)", .rejected.len())]
    ConcurrentModification { rejected: Vec<JobId> },

    /// A new job was handed to `save` with a version other than 0.
    #[error("new job must start at version 0 (got {0})")]
    InvalidNewJob(u64),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StorageError {
    pub fn rejected(&self) -> &[JobId] {
        match self {
            StorageError::ConcurrentModification { rejected } => rejected,
            _ => &[],
        }
    }
}

/// Ordering for [`StorageProvider::fetch_jobs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrder {
    /// Oldest `updated_at` first.
    UpdatedAtAsc,
    /// Highest priority first, then oldest `updated_at`.
    PriorityThenUpdatedAt,
}

/// Persisted key/value entry, keyed by `(name, owner)`.
///
/// Used for server problems such as unresolvable conflicts and degraded health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub owner: String,
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Metadata {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        value: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            value,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub scheduled: usize,
    pub enqueued: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deleted: usize,
    pub recurring_jobs: usize,
}

/// Durable job store shared by every server process.
///
/// All coordination between processes goes through `save`'s version check:
/// a job is stored only if the stored copy is at `job.version() - 1`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Persist a batch of jobs.
    ///
    /// New jobs (no id) must be at version 0 and are assigned an id. Existing
    /// jobs are stored only if the stored version equals `version - 1`; a
    /// missing row counts as a conflict. Conflicting jobs are reported via
    /// [`StorageError::ConcurrentModification`] and every other job is saved.
    async fn save(&self, jobs: &mut [Job]) -> Result<(), StorageError>;

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    /// SCHEDULED jobs due at or before `upto`, earliest first.
    async fn fetch_scheduled_due(
        &self,
        upto: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError>;

    /// Jobs in `state`, optionally only those last updated before `updated_before`.
    async fn fetch_jobs(
        &self,
        state: StateName,
        updated_before: Option<DateTime<Utc>>,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError>;

    /// Remove jobs in `state` last updated before `older_than`; returns how many.
    async fn delete_permanently(
        &self,
        state: StateName,
        older_than: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    async fn count_jobs(&self, state: StateName) -> Result<usize, StorageError>;

    /// Instances of a recurring job currently in one of `states`.
    async fn recurring_job_instances(
        &self,
        recurring_job_id: &str,
        states: &[StateName],
    ) -> Result<Vec<Job>, StorageError>;

    /// Insert or replace a recurring job definition.
    async fn save_recurring_job(&self, job: RecurringJob) -> Result<(), StorageError>;

    async fn fetch_recurring_jobs(&self) -> Result<Vec<RecurringJob>, StorageError>;

    async fn delete_recurring_job(&self, id: &str) -> Result<bool, StorageError>;

    /// Changes whenever the set of recurring definitions changes.
    async fn recurring_jobs_checksum(&self) -> Result<u64, StorageError>;

    async fn save_metadata(&self, metadata: Metadata) -> Result<(), StorageError>;

    async fn fetch_metadata(
        &self,
        name: &str,
        owner: &str,
    ) -> Result<Option<Metadata>, StorageError>;

    async fn delete_metadata(&self, name: &str, owner: &str) -> Result<bool, StorageError>;

    async fn job_stats(&self) -> Result<JobStats, StorageError> {
        Ok(JobStats {
            scheduled: self.count_jobs(StateName::Scheduled).await?,
            enqueued: self.count_jobs(StateName::Enqueued).await?,
            processing: self.count_jobs(StateName::Processing).await?,
            succeeded: self.count_jobs(StateName::Succeeded).await?,
            failed: self.count_jobs(StateName::Failed).await?,
            deleted: self.count_jobs(StateName::Deleted).await?,
            recurring_jobs: self.fetch_recurring_jobs().await?.len(),
        })
    }
}
