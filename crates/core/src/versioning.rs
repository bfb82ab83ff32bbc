//! Scoped optimistic-concurrency versioning for job batches.

use std::ops::{Deref, DerefMut};

use crate::id::JobId;
use crate::job::Job;

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    was_new: bool,
    previous_version: u64,
    committed: bool,
}

/// Guard that bumps versions for a save and rolls them back unless committed.
///
/// On construction every already-persisted job gets `version + 1`. When the
/// guard is dropped, each job that was not committed is restored: persisted
/// jobs get their previous version back, never-persisted jobs lose any id a
/// store may have assigned during the failed attempt.
///
/// ```
/// # use chrono::Utc;
/// # use jobweave_core::{Job, JobDetail, JobVersioner};
/// let mut jobs = vec![Job::enqueued(JobDetail::handler("noop"), Utc::now())];
/// {
///     let versioner = JobVersioner::new(&mut jobs);
///     // ... store.save(&mut versioner) failed, guard dropped uncommitted
///     drop(versioner);
/// }
/// assert!(jobs[0].is_new());
/// ```
pub struct JobVersioner<'a> {
    jobs: &'a mut [Job],
    snapshots: Vec<Snapshot>,
}

impl<'a> JobVersioner<'a> {
    pub fn new(jobs: &'a mut [Job]) -> Self {
        let snapshots = jobs
            .iter_mut()
            .map(|job| {
                let was_new = job.is_new();
                let previous_version = if was_new {
                    job.version()
                } else {
                    job.increase_version()
                };
                Snapshot {
                    was_new,
                    previous_version,
                    committed: false,
                }
            })
            .collect();
        Self { jobs, snapshots }
    }

    /// Keep the new versions of every job.
    pub fn commit_all(mut self) {
        for snapshot in &mut self.snapshots {
            snapshot.committed = true;
        }
    }

    /// Keep the new versions of every job except the `rejected` ones.
    pub fn commit_except(mut self, rejected: &[JobId]) {
        for (job, snapshot) in self.jobs.iter().zip(self.snapshots.iter_mut()) {
            snapshot.committed = match job.id() {
                Some(id) => !rejected.contains(&id),
                None => false,
            };
        }
    }
}

impl Deref for JobVersioner<'_> {
    type Target = [Job];

    fn deref(&self) -> &Self::Target {
        self.jobs
    }
}

impl DerefMut for JobVersioner<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.jobs
    }
}

impl Drop for JobVersioner<'_> {
    fn drop(&mut self) {
        for (job, snapshot) in self.jobs.iter_mut().zip(&self.snapshots) {
            if snapshot.committed {
                continue;
            }
            if snapshot.was_new {
                job.clear_id();
            } else {
                job.restamp_version(snapshot.previous_version);
            }
        }
    }
}
