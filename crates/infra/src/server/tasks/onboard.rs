use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use jobweave_core::StateName;

use super::{Cycle, ServerContext, ServerTask};
use crate::server::error::ServerError;
use crate::storage::JobOrder;

/// Claims ENQUEUED jobs for free workers.
///
/// Runs once per cycle and again whenever a worker frees up. Only one pass
/// runs at a time; a pass that finds another in progress does nothing.
#[derive(Debug, Default)]
pub struct OnboardTask {
    single_flight: Mutex<()>,
}

impl OnboardTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim and dispatch up to the pool's free capacity. Returns how many
    /// jobs were handed to workers.
    pub async fn onboard(&self, ctx: &ServerContext) -> Result<usize, ServerError> {
        let Ok(_guard) = self.single_flight.try_lock() else {
            debug!("onboarding already in progress");
            return Ok(0);
        };

        let capacity = ctx.pool.free_capacity();
        if capacity == 0 {
            return Ok(0);
        }
        let mut jobs = ctx
            .store
            .fetch_jobs(StateName::Enqueued, None, JobOrder::PriorityThenUpdatedAt, capacity)
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let now = ctx.clock.now();
        jobs.retain_mut(|job| match job.start_processing(ctx.server_id, now) {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = ?job.id(), error = %e, "cannot claim job");
                false
            }
        });
        ctx.saver.claim(&mut jobs).await?;

        let mut dispatched = 0;
        for job in jobs {
            let id = job.id();
            match ctx.pool.dispatch(job) {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    warn!(
                        job_id = ?id,
                        error = %e,
                        "claimed job could not be dispatched; it will be recovered as orphaned"
                    );
                }
            }
        }
        if dispatched > 0 {
            debug!(dispatched, "onboarded jobs");
        }
        Ok(dispatched)
    }
}

#[async_trait]
impl ServerTask for OnboardTask {
    fn name(&self) -> &'static str {
        "onboard"
    }

    async fn run(&self, ctx: &ServerContext, _cycle: &Cycle) -> Result<(), ServerError> {
        self.onboard(ctx).await.map(|_| ())
    }
}
