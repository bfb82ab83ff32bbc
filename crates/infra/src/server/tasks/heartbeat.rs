use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{Cycle, ServerContext, ServerTask};
use crate::server::error::ServerError;

/// Refreshes the heartbeat of every job running on this process.
///
/// A job whose lock is held is being completed by its worker and is skipped,
/// as is one already touched at this instant (claimed this cycle).
/// The locks of heartbeated jobs are held until the save settles so the
/// worker always completes against the latest version.
#[derive(Debug, Default)]
pub struct HeartbeatTask;

#[async_trait]
impl ServerTask for HeartbeatTask {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn run(&self, ctx: &ServerContext, cycle: &Cycle) -> Result<(), ServerError> {
        let now = ctx.clock.now();
        let mut guards = HashMap::new();
        let mut batch = Vec::new();

        for (id, entry) in ctx.pool.directory().entries() {
            let Ok(guard) = entry.job.try_lock_owned() else {
                trace!(job_id = %id, "job is completing; skipping heartbeat");
                continue;
            };
            if guard.updated_at() >= now {
                continue;
            }
            let mut job = guard.clone();
            if job.heartbeat(now).is_err() {
                continue;
            }
            batch.push(job);
            guards.insert(id, guard);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let report = ctx.saver.save(&mut batch, cycle.system_slept).await?;
        for settled in batch {
            if let Some(guard) = settled.id().and_then(|id| guards.get_mut(&id)) {
                **guard = settled;
            }
        }
        debug!(updated = report.saved, taken = report.taken, gone = report.gone, "sent heartbeats");
        Ok(())
    }
}
