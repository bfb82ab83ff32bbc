//! Maintenance tasks run by the orchestration loop, in order, once per cycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use jobweave_core::{Clock, ServerId};

use crate::storage::StorageProvider;
use crate::workers::WorkerPool;

use super::config::BackgroundJobServerConfig;
use super::error::ServerError;
use super::save::JobSaver;
use super::time_box::TimeBox;

mod garbage;
mod heartbeat;
mod onboard;
mod orphans;
mod recurring;
mod scheduled;

pub use garbage::GarbageCollectTask;
pub use heartbeat::HeartbeatTask;
pub use onboard::OnboardTask;
pub use orphans::OrphanedJobsTask;
pub use recurring::RecurringJobsTask;
pub use scheduled::ScheduledJobsTask;

/// Process-wide collaborators shared by every task.
pub struct ServerContext {
    pub server_id: ServerId,
    pub config: BackgroundJobServerConfig,
    pub store: Arc<dyn StorageProvider>,
    pub saver: Arc<JobSaver>,
    pub pool: Arc<WorkerPool>,
    pub clock: Arc<dyn Clock>,
}

impl ServerContext {
    pub fn poll_interval(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.poll_interval).unwrap_or(chrono::Duration::MAX)
    }
}

/// One tick of the loop.
#[derive(Debug, Clone, Copy)]
pub struct Cycle {
    /// Wall-clock time the cycle started at.
    pub now: DateTime<Utc>,
    /// Host clock jumped since the previous cycle.
    pub system_slept: bool,
    deadline: Instant,
    time_box_ratio: f64,
}

impl Cycle {
    pub fn new(
        now: DateTime<Utc>,
        system_slept: bool,
        deadline: Instant,
        time_box_ratio: f64,
    ) -> Self {
        Self {
            now,
            system_slept,
            deadline,
            time_box_ratio,
        }
    }

    /// Budget for a task starting now.
    pub fn time_box(&self) -> TimeBox {
        TimeBox::within(self.deadline, self.time_box_ratio)
    }
}

#[async_trait]
pub trait ServerTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &ServerContext, cycle: &Cycle) -> Result<(), ServerError>;
}
