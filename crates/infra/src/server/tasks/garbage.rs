use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use jobweave_core::StateName;

use super::{Cycle, ServerContext, ServerTask};
use crate::server::error::ServerError;
use crate::storage::JobOrder;

/// Retention: old SUCCEEDED jobs become DELETED, old DELETED jobs are purged.
#[derive(Debug, Default)]
pub struct GarbageCollectTask;

fn before(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(chrono::Duration::from_std(age).ok()?)
}

#[async_trait]
impl ServerTask for GarbageCollectTask {
    fn name(&self) -> &'static str {
        "garbage-collect"
    }

    async fn run(&self, ctx: &ServerContext, cycle: &Cycle) -> Result<(), ServerError> {
        let time_box = cycle.time_box();
        let page_size = ctx.config.page_size;

        if let Some(cutoff) = before(cycle.now, ctx.config.delete_succeeded_after) {
            let mut deleted = 0usize;
            while !time_box.is_expired() {
                let mut page = ctx
                    .store
                    .fetch_jobs(
                        StateName::Succeeded,
                        Some(cutoff),
                        JobOrder::UpdatedAtAsc,
                        page_size,
                    )
                    .await?;
                let fetched = page.len();
                if fetched == 0 {
                    break;
                }
                page.retain_mut(|job| job.delete("retention period elapsed", cycle.now).is_ok());
                if page.is_empty() {
                    break;
                }
                let report = ctx.saver.save(&mut page, cycle.system_slept).await?;
                deleted += report.saved;
                if fetched < page_size {
                    break;
                }
            }
            if deleted > 0 {
                info!(deleted, "deleted succeeded jobs past retention");
            }
        }

        if time_box.is_expired() {
            return Ok(());
        }
        if let Some(cutoff) = before(cycle.now, ctx.config.permanently_delete_after) {
            let purged = ctx.store.delete_permanently(StateName::Deleted, cutoff).await?;
            if purged > 0 {
                debug!(purged, "purged deleted jobs");
            }
        }
        Ok(())
    }
}
