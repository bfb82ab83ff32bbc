use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use jobweave_core::{Job, JobId};

/// A job currently executing on this process.
#[derive(Debug, Clone)]
pub struct InFlightJob {
    /// The worker's copy. Held locked while the worker records its outcome.
    pub job: Arc<Mutex<Job>>,
    pub token: CancellationToken,
}

/// Jobs owned by this process's workers, keyed by id.
///
/// Used by heartbeats, by orphan detection to exclude local work, and by the
/// conflict resolver to interrupt workers whose job was taken over.
#[derive(Debug, Clone, Default)]
pub struct WorkerDirectory {
    inner: Arc<RwLock<HashMap<JobId, InFlightJob>>>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, InFlightJob>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, InFlightJob>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job; the entry lives until the returned lease is dropped.
    pub fn register(
        &self,
        id: JobId,
        job: Arc<Mutex<Job>>,
        token: CancellationToken,
    ) -> DirectoryLease {
        self.write().insert(id, InFlightJob { job, token });
        DirectoryLease {
            directory: self.clone(),
            id,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn get(&self, id: JobId) -> Option<InFlightJob> {
        self.read().get(&id).cloned()
    }

    /// Cancel the worker running `id`. Returns false if no worker owns it.
    pub fn interrupt(&self, id: JobId) -> bool {
        match self.read().get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.read().values() {
            entry.token.cancel();
        }
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.read().keys().copied().collect()
    }

    pub fn entries(&self) -> Vec<(JobId, InFlightJob)> {
        self.read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn remove(&self, id: JobId) {
        self.write().remove(&id);
    }
}

/// Removes its directory entry when dropped.
#[derive(Debug)]
pub struct DirectoryLease {
    directory: WorkerDirectory,
    id: JobId,
}

impl Drop for DirectoryLease {
    fn drop(&mut self) {
        self.directory.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobweave_core::JobDetail;

    fn entry() -> (JobId, Arc<Mutex<Job>>, CancellationToken) {
        let job = Job::enqueued(JobDetail::handler("noop"), Utc::now());
        (JobId::new(), Arc::new(Mutex::new(job)), CancellationToken::new())
    }

    #[test]
    fn lease_removes_entry_on_drop() {
        let directory = WorkerDirectory::new();
        let (id, job, token) = entry();

        let lease = directory.register(id, job, token);
        assert!(directory.contains(id));

        drop(lease);
        assert!(!directory.contains(id));
    }

    #[test]
    fn interrupt_cancels_token() {
        let directory = WorkerDirectory::new();
        let (id, job, token) = entry();
        let _lease = directory.register(id, job, token.clone());

        assert!(directory.interrupt(id));
        assert!(token.is_cancelled());
        assert!(!directory.interrupt(JobId::new()));
    }
}
