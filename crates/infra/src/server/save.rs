//! The single save path every job mutation goes through.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use jobweave_core::{Clock, Job, JobId, JobVersioner};

use crate::conflict::{ConflictResolver, Resolution, ResolutionContext};
use crate::filters::JobFilters;
use crate::storage::{StorageError, StorageProvider};
use crate::workers::WorkerDirectory;

use super::error::ServerError;

/// Rounds of re-saving jobs the resolver decided to keep.
pub const MAX_SAVE_ROUNDS: usize = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    /// Jobs stored with their local changes.
    pub saved: usize,
    /// Jobs replaced by their persisted copy.
    pub taken: usize,
    /// Jobs that no longer exist in storage.
    pub gone: usize,
    pub rounds: usize,
}

/// Versioned save with filters and conflict resolution.
///
/// Order: election filters (jobs with unsaved state changes) → versioned
/// store save → applied filters for saved jobs → resolver for rejected jobs.
pub struct JobSaver {
    store: Arc<dyn StorageProvider>,
    resolver: ConflictResolver,
    filters: JobFilters,
    directory: WorkerDirectory,
    clock: Arc<dyn Clock>,
}

impl JobSaver {
    pub fn new(
        store: Arc<dyn StorageProvider>,
        filters: JobFilters,
        directory: WorkerDirectory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(),
            filters,
            directory,
            clock,
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &Arc<dyn StorageProvider> {
        &self.store
    }

    /// Save `jobs`, resolving conflicts.
    ///
    /// On success `jobs` holds the settled copy of every job that still
    /// exists: saved local copies, or persisted copies where those won. Order
    /// is not preserved. On error, jobs not yet settled are left with their
    /// versions rolled back.
    pub async fn save(
        &self,
        jobs: &mut Vec<Job>,
        system_slept: bool,
    ) -> Result<SaveReport, ServerError> {
        if jobs.is_empty() {
            return Ok(SaveReport::default());
        }
        self.filters.elect(jobs, self.clock.now());

        let mut pending = std::mem::take(jobs);
        let mut report = SaveReport::default();
        let result = self
            .save_rounds(&mut pending, jobs, system_slept, &mut report)
            .await;
        jobs.append(&mut pending);

        if report.taken + report.gone > 0 {
            info!(
                saved = report.saved,
                taken = report.taken,
                gone = report.gone,
                "resolved concurrent job modifications"
            );
        }
        result.map(|()| report)
    }

    /// Save one job; `None` if it turned out to be gone.
    pub async fn save_one(&self, job: Job, system_slept: bool) -> Result<Option<Job>, ServerError> {
        let mut batch = vec![job];
        self.save(&mut batch, system_slept).await?;
        Ok(batch.pop())
    }

    /// Save freshly claimed jobs without resolving conflicts.
    ///
    /// A rejected claim means another process got there first; those jobs are
    /// dropped from `jobs`. Returns how many were dropped.
    pub async fn claim(&self, jobs: &mut Vec<Job>) -> Result<usize, ServerError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        self.filters.elect(jobs, self.clock.now());
        let rejected = self.persist(jobs).await?;
        jobs.retain(|j| !j.id().is_some_and(|id| rejected.contains(&id)));
        for job in jobs.iter_mut() {
            self.filters.applied(job);
            job.mark_saved();
        }
        if !rejected.is_empty() {
            debug!(skipped = rejected.len(), "jobs claimed by another server");
        }
        Ok(rejected.len())
    }

    async fn save_rounds(
        &self,
        pending: &mut Vec<Job>,
        settled: &mut Vec<Job>,
        system_slept: bool,
        report: &mut SaveReport,
    ) -> Result<(), ServerError> {
        for round in 1..=MAX_SAVE_ROUNDS {
            if pending.is_empty() {
                return Ok(());
            }
            report.rounds = round;

            let rejected = self.persist(pending).await?;
            let mut persisted = self.fetch_persisted(&rejected).await?;

            let (mut conflicting, saved): (Vec<Job>, Vec<Job>) = pending
                .drain(..)
                .partition(|j| j.id().is_some_and(|id| rejected.contains(&id)));
            for mut job in saved {
                self.filters.applied(&job);
                job.mark_saved();
                settled.push(job);
                report.saved += 1;
            }
            if conflicting.is_empty() {
                return Ok(());
            }

            let persisted: Vec<Option<Job>> = conflicting
                .iter()
                .map(|j| j.id().and_then(|id| persisted.remove(&id)).flatten())
                .collect();
            let ctx = ResolutionContext {
                directory: &self.directory,
                system_slept,
                now: self.clock.now(),
            };
            let resolved = self.resolver.resolve_batch(&mut conflicting, &persisted, &ctx);
            let resolutions = match resolved {
                Ok(resolutions) => resolutions,
                Err(e) => {
                    pending.extend(conflicting);
                    return Err(e.into());
                }
            };
            for resolution in resolutions {
                match resolution {
                    Resolution::KeepLocal(job) => pending.push(job),
                    Resolution::TakePersisted(job) => {
                        settled.push(job);
                        report.taken += 1;
                    }
                    Resolution::Gone => report.gone += 1,
                }
            }
        }

        if pending.is_empty() {
            Ok(())
        } else {
            Err(ServerError::ConflictRoundsExhausted {
                remaining: pending.len(),
                rounds: MAX_SAVE_ROUNDS,
            })
        }
    }

    /// Versioned store save; returns the ids the store rejected.
    async fn persist(&self, jobs: &mut [Job]) -> Result<Vec<JobId>, ServerError> {
        let mut versioner = JobVersioner::new(jobs);
        let result = self.store.save(&mut *versioner).await;
        match result {
            Ok(()) => {
                versioner.commit_all();
                Ok(Vec::new())
            }
            Err(StorageError::ConcurrentModification { rejected }) => {
                versioner.commit_except(&rejected);
                Ok(rejected)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_persisted(
        &self,
        ids: &[JobId],
    ) -> Result<HashMap<JobId, Option<Job>>, ServerError> {
        let mut persisted = HashMap::with_capacity(ids.len());
        for id in ids {
            persisted.insert(*id, self.store.fetch_job(*id).await?);
        }
        Ok(persisted)
    }
}

impl core::fmt::Debug for JobSaver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSaver")
            .field("resolver", &self.resolver)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}
