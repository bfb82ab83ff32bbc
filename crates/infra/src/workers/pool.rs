use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use jobweave_core::{Clock, Job, JobId, JobState, ServerId, StateName};

use crate::server::{JobSaver, ServerError, SleepDetector};

use super::directory::{DirectoryLease, WorkerDirectory};
use super::registry::{HandlerRegistry, JobContext, PermanentFailure};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("job has not been saved yet")]
    Unsaved,
    #[error("job {0} is not processing")]
    NotProcessing(JobId),
    #[error("no free worker")]
    NoCapacity,
    #[error("worker pool is shut down")]
    Closed,
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub size: usize,
    pub busy: usize,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Outcomes dropped because the job was taken over while running.
    pub outcomes_discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    busy: AtomicUsize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

enum Outcome {
    Succeeded,
    Failed {
        message: String,
        cause: String,
        retryable: bool,
    },
}

/// Fixed-size pool running claimed jobs.
///
/// Concurrency is bounded by a semaphore; a job only runs once it has been
/// claimed (saved as PROCESSING by this server). Outcomes go back through
/// the shared [`JobSaver`].
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    directory: WorkerDirectory,
    worker: Worker,
}

/// Everything a single worker task needs.
#[derive(Clone)]
struct Worker {
    registry: Arc<HandlerRegistry>,
    saver: Arc<JobSaver>,
    clock: Arc<dyn Clock>,
    sleep: Arc<SleepDetector>,
    idle: Arc<Notify>,
    fatal: mpsc::UnboundedSender<ServerError>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        registry: Arc<HandlerRegistry>,
        saver: Arc<JobSaver>,
        directory: WorkerDirectory,
        clock: Arc<dyn Clock>,
        sleep: Arc<SleepDetector>,
        fatal: mpsc::UnboundedSender<ServerError>,
    ) -> Self {
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            directory,
            worker: Worker {
                registry,
                saver,
                clock,
                sleep,
                idle: Arc::new(Notify::new()),
                fatal,
                counters: Arc::new(Counters::default()),
            },
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers free to take a job right now.
    pub fn free_capacity(&self) -> usize {
        if self.tracker.is_closed() {
            0
        } else {
            self.permits.available_permits()
        }
    }

    pub fn directory(&self) -> &WorkerDirectory {
        &self.directory
    }

    /// Notified every time a worker finishes a job.
    pub fn idle_notifier(&self) -> Arc<Notify> {
        self.worker.idle.clone()
    }

    /// Start running a claimed job.
    pub fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        let id = job.id().ok_or(DispatchError::Unsaved)?;
        if !job.has_state(StateName::Processing) {
            return Err(DispatchError::NotProcessing(id));
        }
        if self.tracker.is_closed() {
            return Err(DispatchError::Closed);
        }
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| DispatchError::NoCapacity)?;

        let owner = job.last_processing_owner();
        let token = CancellationToken::new();
        let ctx = JobContext {
            job_id: id,
            name: job.name().to_string(),
            handler: job.detail().handler.clone(),
            args: job.detail().args.clone(),
            metadata: job.metadata().clone(),
            cancellation: token.clone(),
        };
        let shared = Arc::new(Mutex::new(job));
        let lease = self.directory.register(id, shared.clone(), token);

        let span = info_span!("job", job_id = %id, handler = %ctx.handler);
        let worker = self.worker.clone();
        self.tracker
            .spawn(worker.run(shared, owner, ctx, permit, lease).instrument(span));
        Ok(())
    }

    /// Wait until every running job has finished, then accept work again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait up to `grace` for running jobs.
    ///
    /// Jobs still running after `grace` are cancelled and given one more
    /// `grace` to wind down. Returns whether every job finished.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }
        warn!(running = self.directory.len(), "cancelling jobs still running after grace period");
        self.directory.cancel_all();
        tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.worker.counters;
        WorkerStats {
            size: self.size,
            busy: c.busy.load(Ordering::Relaxed),
            jobs_processed: c.processed.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            outcomes_discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("free", &self.permits.available_permits())
            .field("in_flight", &self.directory.len())
            .finish()
    }
}

impl Worker {
    async fn run(
        self,
        shared: Arc<Mutex<Job>>,
        owner: Option<ServerId>,
        ctx: JobContext,
        permit: OwnedSemaphorePermit,
        lease: DirectoryLease,
    ) {
        self.counters.busy.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = self.execute(ctx).await;
        self.complete(&shared, owner, outcome, started.elapsed()).await;

        drop(lease);
        drop(permit);
        self.counters.busy.fetch_sub(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.idle.notify_one();
    }

    async fn execute(&self, ctx: JobContext) -> Outcome {
        let Some(handler) = self.registry.get(&ctx.handler) else {
            warn!("no handler for job");
            return Outcome::Failed {
                message: format!("no handler registered for `{}`", ctx.handler),
                cause: "handler not found".to_string(),
                retryable: false,
            };
        };

        // A separate task so a panicking body only fails its own job.
        let body = tokio::spawn(async move { handler.run(ctx).await });
        match body.await {
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(e)) => Outcome::Failed {
                message: e.to_string(),
                cause: format!("{e:#}"),
                retryable: e.downcast_ref::<PermanentFailure>().is_none(),
            },
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let cause = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(cause = %cause, "job panicked");
                Outcome::Failed {
                    message: "job panicked".to_string(),
                    cause,
                    retryable: true,
                }
            }
            Err(e) => Outcome::Failed {
                message: "job task was cancelled".to_string(),
                cause: e.to_string(),
                retryable: true,
            },
        }
    }

    /// Record the outcome, unless the job was taken over while it ran.
    async fn complete(
        &self,
        shared: &Mutex<Job>,
        owner: Option<ServerId>,
        outcome: Outcome,
        processing: Duration,
    ) {
        let mut current = shared.lock().await;
        if !current.has_state(StateName::Processing) || current.last_processing_owner() != owner {
            debug!(
                state = %current.state_name(),
                "job was taken over while running; discarding outcome"
            );
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let now = self.clock.now();
        let mut job = current.clone();
        let applied = match outcome {
            Outcome::Succeeded => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                job.succeed(latency(&job), processing, now)
            }
            Outcome::Failed {
                message,
                cause,
                retryable,
            } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                info!(error = %message, retryable, "job failed");
                job.fail(message, cause, retryable, now)
            }
        };
        if let Err(e) = applied {
            warn!(error = %e, "could not apply job outcome");
            return;
        }

        match self.saver.save_one(job, self.sleep.system_slept()).await {
            Ok(Some(settled)) => *current = settled,
            Ok(None) => debug!("job was purged while running"),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal error while recording job outcome");
                let _ = self.fatal.send(e);
            }
            Err(e) => {
                warn!(error = %e, "could not record job outcome; it will be recovered as orphaned");
            }
        }
    }
}

/// Time between the job being enqueued and starting to process.
fn latency(job: &Job) -> Duration {
    let started = job.history().iter().rev().find_map(|s| match s {
        JobState::Processing { created_at, .. } => Some(*created_at),
        _ => None,
    });
    match (job.enqueued_at(), started) {
        (Some(enqueued), Some(started)) => (started - enqueued).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    }
}
