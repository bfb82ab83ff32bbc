//! Background job server: the per-process orchestration loop.
//!
//! ## Cycle
//!
//! Once per poll interval, in order:
//!
//! 1. enqueue due SCHEDULED jobs
//! 2. expand recurring jobs
//! 3. onboard ENQUEUED jobs onto free workers
//! 4. heartbeat jobs running here
//! 5. fail orphaned PROCESSING jobs
//! 6. retention
//!
//! Every task is time-boxed to a share of what is left of the cycle. A worker
//! finishing a job triggers an extra onboarding pass between cycles.

pub mod config;
pub mod error;
pub mod health;
pub mod save;
pub mod sleep;
pub mod tasks;
pub mod time_box;

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use jobweave_core::{Clock, ServerId, SystemClock};

use crate::filters::JobFilters;
use crate::storage::{Metadata, StorageProvider};
use crate::workers::{HandlerRegistry, WorkerDirectory, WorkerPool, WorkerStats};

pub use config::{BackgroundJobServerConfig, ConfigError};
pub use error::ServerError;
pub use health::{HealthStatus, TaskHealth};
pub use save::{JobSaver, MAX_SAVE_ROUNDS, SaveReport};
pub use sleep::SleepDetector;
pub use tasks::{Cycle, ServerContext, ServerTask};
pub use time_box::TimeBox;

use tasks::{
    GarbageCollectTask, HeartbeatTask, OnboardTask, OrphanedJobsTask, RecurringJobsTask,
    ScheduledJobsTask,
};

/// Metadata name of the problem recorded for an unresolvable conflict.
pub const UNRESOLVABLE_CONFLICT_PROBLEM: &str = "problem.unresolvable-conflict";
/// Metadata name of the problem recorded while the server is degraded.
pub const TASK_FAILURES_PROBLEM: &str = "problem.task-failures";

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builder for [`BackgroundJobServer`].
pub struct BackgroundJobServerBuilder {
    store: Arc<dyn StorageProvider>,
    config: BackgroundJobServerConfig,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    filters: Option<JobFilters>,
}

impl BackgroundJobServerBuilder {
    pub fn config(mut self, config: BackgroundJobServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default filters (retry + state logging).
    pub fn filters(mut self, filters: JobFilters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn build(self) -> Result<BackgroundJobServer, ServerError> {
        self.config.validate()?;
        let server_id = self.config.server_id.unwrap_or_default();
        let filters = self
            .filters
            .unwrap_or_else(|| JobFilters::standard(self.config.retry_policy.clone()));

        let directory = WorkerDirectory::new();
        let saver = Arc::new(JobSaver::new(
            self.store.clone(),
            filters,
            directory.clone(),
            self.clock.clone(),
        ));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let sleep = Arc::new(SleepDetector::new(self.config.poll_interval));
        let pool = Arc::new(WorkerPool::new(
            self.config.worker_count,
            Arc::new(self.registry),
            saver.clone(),
            directory,
            self.clock.clone(),
            sleep.clone(),
            fatal_tx,
        ));

        let onboard = Arc::new(OnboardTask::new());
        let recurring = Arc::new(RecurringJobsTask::new());
        let tasks: Vec<Arc<dyn ServerTask>> = vec![
            Arc::new(ScheduledJobsTask),
            recurring.clone(),
            onboard.clone(),
            Arc::new(HeartbeatTask),
            Arc::new(OrphanedJobsTask),
            Arc::new(GarbageCollectTask),
        ];
        let health = TaskHealth::new(
            self.config.failure_window(),
            self.config.task_failure_threshold,
        );

        Ok(BackgroundJobServer {
            inner: Arc::new(Orchestrator {
                ctx: ServerContext {
                    server_id,
                    config: self.config,
                    store: self.store,
                    saver,
                    pool,
                    clock: self.clock,
                },
                tasks,
                onboard,
                recurring,
                health: StdMutex::new(health),
                sleep,
                fatal_rx: Mutex::new(fatal_rx),
            }),
            running: StdMutex::new(None),
        })
    }
}

/// A job server process.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use jobweave_infra::server::BackgroundJobServer;
/// # use jobweave_infra::storage::InMemoryStorageProvider;
/// # use jobweave_infra::workers::HandlerRegistry;
/// # async fn demo() -> Result<(), jobweave_infra::server::ServerError> {
/// let server = BackgroundJobServer::builder(Arc::new(InMemoryStorageProvider::new()))
///     .registry(HandlerRegistry::new().with_fn("noop", |_| async { Ok(()) }))
///     .build()?;
/// server.start()?;
/// // ...
/// server.stop().await
/// # }
/// ```
pub struct BackgroundJobServer {
    inner: Arc<Orchestrator>,
    running: StdMutex<Option<Running>>,
}

struct Running {
    shutdown: CancellationToken,
    finished: CancellationToken,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl BackgroundJobServer {
    pub fn builder(store: Arc<dyn StorageProvider>) -> BackgroundJobServerBuilder {
        BackgroundJobServerBuilder {
            store,
            config: BackgroundJobServerConfig::default(),
            registry: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            filters: None,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.ctx.server_id
    }

    pub fn config(&self) -> &BackgroundJobServerConfig {
        &self.inner.ctx.config
    }

    pub fn health(&self) -> HealthStatus {
        lock(&self.inner.health).status()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.inner.ctx.pool.stats()
    }

    /// Jobs currently running on this process.
    pub fn directory(&self) -> &WorkerDirectory {
        self.inner.ctx.pool.directory()
    }

    /// Upper bound of the last window `recurring_job_id` was expanded for.
    pub async fn recurring_watermark(&self, recurring_job_id: &str) -> Option<DateTime<Utc>> {
        self.inner.recurring.watermark(recurring_job_id).await
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(ServerError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();
        let span = info_span!(
            "job_server",
            server = %self.inner.ctx.config.name,
            server_id = %self.inner.ctx.server_id
        );
        let handle = tokio::spawn(
            self.inner
                .clone()
                .run(shutdown.clone(), finished.clone())
                .instrument(span),
        );
        *running = Some(Running {
            shutdown,
            finished,
            handle,
        });
        Ok(())
    }

    /// Stop the loop and wait for running jobs (up to the shutdown grace).
    ///
    /// Returns the error that made the loop stop on its own, if any.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(running) = lock(&self.running).take() else {
            return Ok(());
        };
        running.shutdown.cancel();
        running
            .handle
            .await
            .map_err(|e| ServerError::Join(e.to_string()))?
    }

    /// Resolves once the loop has exited, whether stopped or failed.
    pub async fn stopped(&self) {
        let finished = lock(&self.running).as_ref().map(|r| r.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    /// Run one cycle inline.
    ///
    /// Non-fatal task errors are logged and counted towards health; an
    /// unresolvable conflict is recorded as a problem and returned.
    pub async fn run_cycle(&self) -> Result<(), ServerError> {
        self.inner.run_cycle().await
    }

    /// Wait until every running job has finished.
    pub async fn drain(&self) {
        self.inner.ctx.pool.drain().await;
    }
}

impl core::fmt::Debug for BackgroundJobServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackgroundJobServer")
            .field("server_id", &self.inner.ctx.server_id)
            .field("name", &self.inner.ctx.config.name)
            .field("pool", &self.inner.ctx.pool)
            .finish_non_exhaustive()
    }
}

struct Orchestrator {
    ctx: ServerContext,
    tasks: Vec<Arc<dyn ServerTask>>,
    onboard: Arc<OnboardTask>,
    recurring: Arc<RecurringJobsTask>,
    health: StdMutex<TaskHealth>,
    sleep: Arc<SleepDetector>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<ServerError>>,
}

impl Orchestrator {
    async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
        finished: CancellationToken,
    ) -> Result<(), ServerError> {
        let _finished = finished.drop_guard();
        let mut fatal_rx = self.fatal_rx.lock().await;
        let idle = self.ctx.pool.idle_notifier();
        let stop_on_conflict = self.ctx.config.stop_on_unresolvable_conflict;

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            workers = self.ctx.pool.size(),
            poll_interval_secs = self.ctx.config.poll_interval.as_secs_f64(),
            "background job server started"
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("background job server received shutdown signal");
                    break Ok(());
                }
                Some(err) = fatal_rx.recv() => {
                    self.record_fatal(&err).await;
                    if stop_on_conflict {
                        break Err(err);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        if stop_on_conflict {
                            break Err(e);
                        }
                    }
                }
                _ = idle.notified() => {
                    if let Err(e) = self.onboard.onboard(&self.ctx).await {
                        self.task_failed("onboard", &e).await;
                    }
                }
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "background job server stopping after fatal error");
        }
        let drained = self.ctx.pool.shutdown(self.ctx.config.shutdown_grace).await;
        if !drained {
            warn!(running = self.ctx.pool.directory().len(), "jobs still running at shutdown");
        }
        info!("background job server stopped");
        result
    }

    async fn run_cycle(&self) -> Result<(), ServerError> {
        let now = self.ctx.clock.now();
        let system_slept = self.sleep.observe(now);
        if system_slept {
            warn!("host clock jumped since the previous cycle; preferring persisted job state");
        }

        let cycle = Cycle::new(
            now,
            system_slept,
            Instant::now() + self.ctx.config.poll_interval,
            self.ctx.config.time_box_ratio,
        );
        for task in &self.tasks {
            let started = Instant::now();
            match task.run(&self.ctx, &cycle).await {
                Ok(()) => {
                    debug!(
                        task = task.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "task finished"
                    );
                }
                Err(e) if e.is_fatal() => {
                    self.record_fatal(&e).await;
                    return Err(e);
                }
                Err(e) => self.task_failed(task.name(), &e).await,
            }
        }

        let recovered = lock(&self.health).refresh(now);
        if recovered {
            info!("task failures aged out; server healthy again");
            let owner = self.ctx.server_id.to_string();
            if let Err(e) = self.ctx.store.delete_metadata(TASK_FAILURES_PROBLEM, &owner).await {
                warn!(error = %e, "could not clear task failure problem");
            }
        }
        Ok(())
    }

    async fn task_failed(&self, task: &'static str, err: &ServerError) {
        warn!(task, error = %err, "task failed; it will run again next cycle");
        let now = self.ctx.clock.now();
        let (degraded, recent) = {
            let mut health = lock(&self.health);
            (health.record_failure(now), health.recent_failures())
        };
        if degraded {
            error!(task, recent_failures = recent, "too many task failures; server is degraded");
            self.record_problem(
                TASK_FAILURES_PROBLEM,
                json!({
                    "server": self.ctx.config.name,
                    "task": task,
                    "recent_failures": recent,
                    "last_error": err.to_string(),
                }),
            )
            .await;
        }
    }

    async fn record_fatal(&self, err: &ServerError) {
        error!(error = %err, "unresolvable job conflict");
        self.record_problem(
            UNRESOLVABLE_CONFLICT_PROBLEM,
            json!({
                "server": self.ctx.config.name,
                "error": err.to_string(),
            }),
        )
        .await;
    }

    async fn record_problem(&self, name: &str, value: serde_json::Value) {
        let metadata = Metadata::new(
            name,
            self.ctx.server_id.to_string(),
            value,
            self.ctx.clock.now(),
        );
        if let Err(e) = self.ctx.store.save_metadata(metadata).await {
            warn!(problem = name, error = %e, "could not record server problem");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::TimeZone;
    use jobweave_core::{Job, JobDetail, JobId, ManualClock, StateName};

    use crate::storage::InMemoryStorageProvider;
    use crate::storage::testing::ScriptedStore;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> BackgroundJobServerConfig {
        BackgroundJobServerConfig::default()
            .with_poll_interval(Duration::from_secs(5))
            .with_worker_count(2)
            .with_task_failure_threshold(2)
    }

    #[tokio::test]
    async fn builder_rejects_invalid_config() {
        let err = BackgroundJobServer::builder(Arc::new(InMemoryStorageProvider::new()))
            .config(config().with_worker_count(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let server = BackgroundJobServer::builder(Arc::new(InMemoryStorageProvider::new()))
            .config(config())
            .build()
            .unwrap();

        server.start().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    type RaceOutcome = (
        BackgroundJobServer,
        Arc<ScriptedStore>,
        JobId,
        Result<(), ServerError>,
    );

    /// Runs a cycle `gap_secs` after the previous one while a due job is
    /// re-saved by another server on every read.
    async fn resaved_scheduled_job(gap_secs: i64) -> RaceOutcome {
        let store = Arc::new(ScriptedStore::new());
        let clock = Arc::new(ManualClock::new(t(0)));
        let server = BackgroundJobServer::builder(store.clone())
            .config(config().with_page_size(1))
            .clock(clock.clone())
            .build()
            .unwrap();
        server.run_cycle().await.unwrap();

        let mut jobs = vec![Job::scheduled(JobDetail::handler("later"), t(gap_secs), t(0))];
        store.save(&mut jobs).await.unwrap();
        let id = jobs[0].id().unwrap();

        store.race_resaves.store(true, Ordering::SeqCst);
        clock.set(t(gap_secs));
        let result = server.run_cycle().await;
        (server, store, id, result)
    }

    #[tokio::test]
    async fn clock_jump_lets_persisted_copies_win() {
        let (server, store, id, result) = resaved_scheduled_job(11).await;

        result.unwrap();
        assert!(server.inner.sleep.system_slept());
        assert_eq!(server.inner.sleep.last_cycle(), Some(t(11)));

        let job = store.fetch_job(id).await.unwrap().unwrap();
        assert_eq!(job.state_name(), StateName::Scheduled);
        assert_eq!(job.version(), 2);
        assert!(store
            .fetch_metadata(UNRESOLVABLE_CONFLICT_PROBLEM, &server.server_id().to_string())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn gap_of_exactly_two_polls_is_not_a_sleep() {
        let (server, store, id, result) = resaved_scheduled_job(10).await;

        assert!(matches!(result, Err(ServerError::UnresolvableConflict(_))));
        assert!(!server.inner.sleep.system_slept());
        assert_eq!(
            store.fetch_job(id).await.unwrap().unwrap().state_name(),
            StateName::Scheduled
        );
    }

    #[tokio::test]
    async fn scheduled_jobs_are_handled_once_per_cycle() {
        let (_server, store, _id, result) = resaved_scheduled_job(11).await;

        result.unwrap();
        // One cycle with nothing due, then the page and the refetch that
        // only returns the job already handled.
        assert_eq!(store.scheduled_fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn repeated_task_failures_degrade_health() {
        let store = Arc::new(ScriptedStore::new());
        store.fail_scheduled_fetch.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new(t(0)));
        let server = BackgroundJobServer::builder(store.clone())
            .config(config())
            .clock(clock.clone())
            .build()
            .unwrap();
        let owner = server.server_id().to_string();

        server.run_cycle().await.unwrap();
        assert_eq!(server.health(), HealthStatus::Healthy);

        clock.advance(chrono::Duration::seconds(5));
        server.run_cycle().await.unwrap();
        assert!(matches!(server.health(), HealthStatus::Degraded { .. }));
        let problem = store
            .fetch_metadata(TASK_FAILURES_PROBLEM, &owner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(problem.value["task"], "scheduled-jobs");
    }

    #[tokio::test]
    async fn scheduled_job_is_enqueued_by_a_cycle() {
        let store = Arc::new(InMemoryStorageProvider::new());
        let clock = Arc::new(ManualClock::new(t(0)));
        let server = BackgroundJobServer::builder(store.clone())
            .config(config().with_worker_count(1))
            .clock(clock.clone())
            .build()
            .unwrap();

        let mut jobs = vec![Job::scheduled(JobDetail::handler("later"), t(30), t(0))];
        store.save(&mut jobs).await.unwrap();
        let id = jobs[0].id().unwrap();

        server.run_cycle().await.unwrap();
        assert_eq!(
            store.fetch_job(id).await.unwrap().unwrap().state_name(),
            StateName::Scheduled
        );

        clock.set(t(26));
        server.run_cycle().await.unwrap();
        let job = store.fetch_job(id).await.unwrap().unwrap();
        assert_ne!(job.state_name(), StateName::Scheduled);
    }
}
