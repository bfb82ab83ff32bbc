use async_trait::async_trait;
use tracing::{info, warn};

use jobweave_core::StateName;

use super::{Cycle, ServerContext, ServerTask};
use crate::server::error::ServerError;
use crate::storage::JobOrder;

/// Fails PROCESSING jobs whose owner stopped sending heartbeats.
///
/// The failure is retryable, so the retry filter reschedules the job.
#[derive(Debug, Default)]
pub struct OrphanedJobsTask;

#[async_trait]
impl ServerTask for OrphanedJobsTask {
    fn name(&self) -> &'static str {
        "orphaned-jobs"
    }

    async fn run(&self, ctx: &ServerContext, cycle: &Cycle) -> Result<(), ServerError> {
        let time_box = cycle.time_box();
        let timeout = chrono::Duration::from_std(ctx.config.server_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = cycle.now.checked_sub_signed(timeout) else {
            return Ok(());
        };
        let page_size = ctx.config.page_size;
        let directory = ctx.pool.directory();
        let mut recovered = 0usize;

        while !time_box.is_expired() {
            let page = ctx
                .store
                .fetch_jobs(StateName::Processing, Some(cutoff), JobOrder::UpdatedAtAsc, page_size)
                .await?;
            let fetched = page.len();

            let mut orphans = Vec::with_capacity(fetched);
            for mut job in page {
                if job.id().is_some_and(|id| directory.contains(id)) {
                    continue;
                }
                let owner = job.last_processing_owner();
                let cause = format!(
                    "no heartbeat from server {} since {}",
                    owner.map(|o| o.to_string()).unwrap_or_else(|| "<unknown>".into()),
                    job.updated_at().to_rfc3339()
                );
                match job.fail("orphaned", cause, true, cycle.now) {
                    Ok(()) => orphans.push(job),
                    Err(e) => warn!(job_id = ?job.id(), error = %e, "cannot fail orphaned job"),
                }
            }
            if orphans.is_empty() {
                break;
            }

            let report = ctx.saver.save(&mut orphans, cycle.system_slept).await?;
            recovered += report.saved;
            if fetched < page_size {
                break;
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered orphaned jobs");
        }
        Ok(())
    }
}
