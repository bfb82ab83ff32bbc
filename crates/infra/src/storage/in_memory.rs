use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobweave_core::{Job, JobId, RecurringJob, StateName};

use super::provider::{JobOrder, Metadata, StorageError, StorageProvider};

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Storage("lock poisoned".to_string())
}

/// In-memory storage provider.
///
/// Intended for tests/dev. Honours the full versioning contract, so several
/// servers sharing one instance behave like processes sharing a database.
#[derive(Debug, Default)]
pub struct InMemoryStorageProvider {
    jobs: RwLock<HashMap<JobId, Job>>,
    recurring_jobs: RwLock<BTreeMap<String, RecurringJob>>,
    recurring_generation: AtomicU64,
    metadata: RwLock<HashMap<(String, String), Metadata>>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored copies carry no pending state changes.
    fn snapshot(job: &Job) -> Job {
        let mut stored = job.clone();
        stored.mark_saved();
        stored
    }

    fn sort(jobs: &mut [Job], order: JobOrder) {
        match order {
            JobOrder::UpdatedAtAsc => jobs.sort_by_key(|j| j.updated_at()),
            JobOrder::PriorityThenUpdatedAt => {
                jobs.sort_by(|a, b| {
                    b.priority()
                        .cmp(&a.priority())
                        .then_with(|| a.updated_at().cmp(&b.updated_at()))
                })
            }
        }
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn save(&self, jobs: &mut [Job]) -> Result<(), StorageError> {
        if let Some(job) = jobs.iter().find(|j| j.is_new() && j.version() != 0) {
            return Err(StorageError::InvalidNewJob(job.version()));
        }

        let mut stored = self.jobs.write().map_err(poisoned)?;
        let mut rejected = Vec::new();

        for job in jobs.iter_mut() {
            match job.id() {
                None => {
                    let id = JobId::new();
                    job.assign_id(id);
                    stored.insert(id, Self::snapshot(job));
                }
                Some(id) => {
                    let matches = stored
                        .get(&id)
                        .is_some_and(|current| current.version() + 1 == job.version());
                    if matches {
                        stored.insert(id, Self::snapshot(job));
                    } else {
                        rejected.push(id);
                    }
                }
            }
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(StorageError::ConcurrentModification { rejected })
        }
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    async fn fetch_scheduled_due(
        &self,
        upto: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| j.scheduled_at().is_some_and(|at| at <= upto))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.scheduled_at());
        due.truncate(limit);
        Ok(due)
    }

    async fn fetch_jobs(
        &self,
        state: StateName,
        updated_before: Option<DateTime<Utc>>,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.has_state(state) && updated_before.is_none_or(|cutoff| j.updated_at() < cutoff)
            })
            .cloned()
            .collect();
        Self::sort(&mut result, order);
        result.truncate(limit);
        Ok(result)
    }

    async fn delete_permanently(
        &self,
        state: StateName,
        older_than: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.has_state(state) && j.updated_at() < older_than));
        Ok(before - jobs.len())
    }

    async fn count_jobs(&self, state: StateName) -> Result<usize, StorageError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.values().filter(|j| j.has_state(state)).count())
    }

    async fn recurring_job_instances(
        &self,
        recurring_job_id: &str,
        states: &[StateName],
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.recurring_job_id() == Some(recurring_job_id) && states.contains(&j.state_name())
            })
            .cloned()
            .collect())
    }

    async fn save_recurring_job(&self, job: RecurringJob) -> Result<(), StorageError> {
        let mut recurring = self.recurring_jobs.write().map_err(poisoned)?;
        recurring.insert(job.id.clone(), job);
        self.recurring_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_recurring_jobs(&self) -> Result<Vec<RecurringJob>, StorageError> {
        let recurring = self.recurring_jobs.read().map_err(poisoned)?;
        Ok(recurring.values().cloned().collect())
    }

    async fn delete_recurring_job(&self, id: &str) -> Result<bool, StorageError> {
        let mut recurring = self.recurring_jobs.write().map_err(poisoned)?;
        let removed = recurring.remove(id).is_some();
        if removed {
            self.recurring_generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn recurring_jobs_checksum(&self) -> Result<u64, StorageError> {
        Ok(self.recurring_generation.load(Ordering::SeqCst))
    }

    async fn save_metadata(&self, metadata: Metadata) -> Result<(), StorageError> {
        let mut entries = self.metadata.write().map_err(poisoned)?;
        let key = (metadata.name.clone(), metadata.owner.clone());
        let created_at = entries
            .get(&key)
            .map(|m| m.created_at)
            .unwrap_or(metadata.created_at);
        entries.insert(
            key,
            Metadata {
                created_at,
                ..metadata
            },
        );
        Ok(())
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        owner: &str,
    ) -> Result<Option<Metadata>, StorageError> {
        let entries = self.metadata.read().map_err(poisoned)?;
        Ok(entries.get(&(name.to_string(), owner.to_string())).cloned())
    }

    async fn delete_metadata(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let mut entries = self.metadata.write().map_err(poisoned)?;
        Ok(entries
            .remove(&(name.to_string(), owner.to_string()))
            .is_some())
    }
}
