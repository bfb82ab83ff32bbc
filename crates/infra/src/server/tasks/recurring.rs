use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use jobweave_core::{Job, RecurringJob, StateName};

use super::{Cycle, ServerContext, ServerTask};
use crate::server::error::ServerError;

/// Instance states that count as "already pending" for a recurring job.
const PENDING_STATES: [StateName; 3] = [
    StateName::Scheduled,
    StateName::Enqueued,
    StateName::Processing,
];

#[derive(Debug, Default)]
struct RecurringState {
    checksum: Option<u64>,
    definitions: Vec<RecurringJob>,
    /// Upper bound of the last window each definition was expanded for.
    watermarks: HashMap<String, DateTime<Utc>>,
}

/// Expands recurring definitions into SCHEDULED instances.
///
/// Each definition is expanded over `(watermark, now + poll]`. A single due
/// occurrence is skipped while an earlier instance is still pending; several
/// due occurrences mean the server fell behind, and every missed instant is
/// scheduled. At most `page_size` instances are produced per definition per
/// cycle.
#[derive(Debug, Default)]
pub struct RecurringJobsTask {
    state: Mutex<RecurringState>,
}

impl RecurringJobsTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watermark for `id`, if the definition has been expanded before.
    pub async fn watermark(&self, id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.watermarks.get(id).copied()
    }

    async fn reload_if_changed(
        &self,
        ctx: &ServerContext,
        state: &mut RecurringState,
    ) -> Result<(), ServerError> {
        let checksum = ctx.store.recurring_jobs_checksum().await?;
        if state.checksum == Some(checksum) {
            return Ok(());
        }
        state.definitions = ctx.store.fetch_recurring_jobs().await?;
        let live: HashSet<&str> = state.definitions.iter().map(|d| d.id.as_str()).collect();
        state.watermarks.retain(|id, _| live.contains(id.as_str()));
        state.checksum = Some(checksum);
        debug!(definitions = state.definitions.len(), "reloaded recurring jobs");
        Ok(())
    }

    /// Instances to create for one definition, and the watermark to store
    /// once they are saved.
    async fn expand(
        &self,
        ctx: &ServerContext,
        definition: &RecurringJob,
        from: DateTime<Utc>,
        upto: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Job>, DateTime<Utc>), ServerError> {
        let page_size = ctx.config.page_size;
        let due: Vec<DateTime<Utc>> = definition
            .occurrences(from, upto)?
            .take(page_size + 1)
            .collect();
        if due.is_empty() {
            return Ok((Vec::new(), upto));
        }

        let pending = ctx
            .store
            .recurring_job_instances(&definition.id, &PENDING_STATES)
            .await?;

        if due.len() == 1 {
            if !pending.is_empty() {
                debug!(
                    recurring_job_id = %definition.id,
                    "previous instance still pending; skipping occurrence"
                );
                return Ok((Vec::new(), upto));
            }
            return Ok((vec![definition.to_scheduled_job(due[0], now)], upto));
        }

        let (due, watermark) = if due.len() > page_size {
            let due = &due[..page_size];
            (due, due[page_size - 1])
        } else {
            (&due[..], upto)
        };
        let present: HashSet<DateTime<Utc>> = pending
            .iter()
            .filter_map(Job::first_scheduled_at)
            .collect();
        let jobs: Vec<Job> = due
            .iter()
            .filter(|at| !present.contains(at))
            .map(|at| definition.to_scheduled_job(*at, now))
            .collect();
        info!(
            recurring_job_id = %definition.id,
            missed = due.len(),
            scheduled = jobs.len(),
            "catching up on missed recurring occurrences"
        );
        Ok((jobs, watermark))
    }
}

#[async_trait]
impl ServerTask for RecurringJobsTask {
    fn name(&self) -> &'static str {
        "recurring-jobs"
    }

    async fn run(&self, ctx: &ServerContext, cycle: &Cycle) -> Result<(), ServerError> {
        let time_box = cycle.time_box();
        let mut state = self.state.lock().await;
        self.reload_if_changed(ctx, &mut state).await?;

        let upto = cycle.now + ctx.poll_interval();
        let mut batch = Vec::new();
        let mut advanced = Vec::new();

        for definition in &state.definitions {
            if time_box.is_expired() {
                break;
            }
            let from = state
                .watermarks
                .get(&definition.id)
                .copied()
                .unwrap_or(cycle.now);
            match self.expand(ctx, definition, from, upto, cycle.now).await {
                Ok((jobs, watermark)) => {
                    batch.extend(jobs);
                    advanced.push((definition.id.clone(), watermark));
                }
                Err(ServerError::Schedule(e)) => {
                    warn!(
                        recurring_job_id = %definition.id,
                        error = %e,
                        "skipping recurring job with invalid schedule"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !batch.is_empty() {
            let report = ctx.saver.save(&mut batch, cycle.system_slept).await?;
            debug!(scheduled = report.saved, "scheduled recurring job instances");
        }
        state.watermarks.extend(advanced);
        Ok(())
    }
}
