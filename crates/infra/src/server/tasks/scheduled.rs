use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Cycle, ServerContext, ServerTask};
use crate::server::error::ServerError;

/// Moves SCHEDULED jobs due before the next cycle to ENQUEUED.
///
/// Each job is handled at most once per cycle: a conflict may settle on a
/// persisted copy that is still SCHEDULED and due, and refetching it would
/// never make progress.
#[derive(Debug, Default)]
pub struct ScheduledJobsTask;

#[async_trait]
impl ServerTask for ScheduledJobsTask {
    fn name(&self) -> &'static str {
        "scheduled-jobs"
    }

    async fn run(&self, ctx: &ServerContext, cycle: &Cycle) -> Result<(), ServerError> {
        let time_box = cycle.time_box();
        let upto = cycle.now + ctx.poll_interval();
        let page_size = ctx.config.page_size;
        let mut enqueued = 0usize;
        let mut handled = HashSet::new();

        while !time_box.is_expired() {
            let mut page = ctx.store.fetch_scheduled_due(upto, page_size).await?;
            let fetched = page.len();
            page.retain(|job| job.id().is_some_and(|id| handled.insert(id)));
            if page.is_empty() {
                break;
            }
            page.retain_mut(|job| match job.enqueue(cycle.now) {
                Ok(()) => true,
                Err(e) => {
                    warn!(job_id = ?job.id(), error = %e, "cannot enqueue scheduled job");
                    false
                }
            });
            if page.is_empty() {
                break;
            }
            let report = ctx.saver.save(&mut page, cycle.system_slept).await?;
            enqueued += report.saved;
            if fetched < page_size {
                break;
            }
        }

        if enqueued > 0 {
            debug!(enqueued, "enqueued scheduled jobs");
        }
        Ok(())
    }
}
