use jobweave_core::{Job, JobState, StateName};

use super::{ConflictRule, Resolution, ResolutionContext};

/// Persisted copy was deleted while this process was running the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletedWhileProcessing;

impl ConflictRule for DeletedWhileProcessing {
    fn name(&self) -> &'static str {
        "deleted-while-processing"
    }

    fn matches(&self, local: &Job, persisted: &Job, _ctx: &ResolutionContext<'_>) -> bool {
        local.has_state(StateName::Processing) && persisted.has_state(StateName::Deleted)
    }

    fn resolve(&self, local: &mut Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> Resolution {
        ctx.interrupt_owner(local);
        if let Err(e) = local.delete("job was deleted while processing", ctx.now) {
            tracing::debug!(job_id = ?local.id(), error = %e, "local copy not marked deleted");
        }
        Resolution::TakePersisted(persisted.clone())
    }
}

/// Persisted copy was deleted while the local copy was not running.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletedWhileIdle;

impl ConflictRule for DeletedWhileIdle {
    fn name(&self) -> &'static str {
        "deleted-while-idle"
    }

    fn matches(&self, local: &Job, persisted: &Job, _ctx: &ResolutionContext<'_>) -> bool {
        matches!(
            local.state_name(),
            StateName::Enqueued | StateName::Scheduled | StateName::Failed | StateName::Succeeded
        ) && persisted.has_state(StateName::Deleted)
    }

    fn resolve(
        &self,
        _local: &mut Job,
        persisted: &Job,
        _ctx: &ResolutionContext<'_>,
    ) -> Resolution {
        Resolution::TakePersisted(persisted.clone())
    }
}

/// Another process completed the job while it was running here.
#[derive(Debug, Clone, Copy, Default)]
pub struct SucceededWhileProcessing;

impl ConflictRule for SucceededWhileProcessing {
    fn name(&self) -> &'static str {
        "succeeded-while-processing"
    }

    fn matches(&self, local: &Job, persisted: &Job, _ctx: &ResolutionContext<'_>) -> bool {
        local.has_state(StateName::Processing) && persisted.has_state(StateName::Succeeded)
    }

    fn resolve(&self, local: &mut Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> Resolution {
        ctx.interrupt_owner(local);
        Resolution::TakePersisted(persisted.clone())
    }
}

/// Another process declared the job orphaned and failed it (and possibly
/// already rescheduled it) while it was running here. Covers both a stale
/// PROCESSING copy and the worker's own outcome for that run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailedWhileProcessing;

impl FailedWhileProcessing {
    /// The PROCESSING entry of the run `local` is in, or of the run whose
    /// outcome (SUCCEEDED, FAILED, retry SCHEDULED) it has not saved yet.
    fn local_run(local: &Job) -> Option<&JobState> {
        let history = local.history();
        let position = history
            .iter()
            .rposition(|s| s.name() == StateName::Processing)?;
        let outcome = history.len() - 1 - position;
        let in_run = match local.state_name() {
            StateName::Processing => outcome == 0,
            StateName::Succeeded | StateName::Failed | StateName::Scheduled => {
                outcome <= local.unsaved_state_changes()
            }
            _ => false,
        };
        in_run.then(|| &history[position])
    }

    /// Whether `persisted` records a FAILED after the local run's PROCESSING entry.
    fn failed_after_local_run(local: &Job, persisted: &Job) -> bool {
        let Some(JobState::Processing {
            server_id,
            created_at,
            ..
        }) = Self::local_run(local)
        else {
            return false;
        };
        let history = persisted.history();
        let Some(position) = history.iter().position(|s| {
            matches!(s, JobState::Processing { server_id: sid, created_at: at, .. }
                if sid == server_id && at == created_at)
        }) else {
            return false;
        };
        history[position + 1..]
            .iter()
            .any(|s| matches!(s, JobState::Failed { .. }))
    }
}

impl ConflictRule for FailedWhileProcessing {
    fn name(&self) -> &'static str {
        "failed-while-processing"
    }

    fn matches(&self, local: &Job, persisted: &Job, _ctx: &ResolutionContext<'_>) -> bool {
        matches!(
            persisted.state_name(),
            StateName::Failed | StateName::Scheduled | StateName::Enqueued
        ) && Self::failed_after_local_run(local, persisted)
    }

    fn resolve(&self, local: &mut Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> Resolution {
        ctx.interrupt_owner(local);
        Resolution::TakePersisted(persisted.clone())
    }
}

/// The job advanced by more than one save and was last processed by another server.
#[derive(Debug, Clone, Copy, Default)]
pub struct RanOnAnotherServer;

impl ConflictRule for RanOnAnotherServer {
    fn name(&self) -> &'static str {
        "ran-on-another-server"
    }

    fn matches(&self, local: &Job, persisted: &Job, _ctx: &ResolutionContext<'_>) -> bool {
        persisted.version() > local.version() + 1
            && persisted.last_processing_owner() != local.last_processing_owner()
    }

    fn resolve(&self, local: &mut Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> Resolution {
        ctx.interrupt_owner(local);
        Resolution::TakePersisted(persisted.clone())
    }
}

/// The job moved on by exactly one save while our stale copy still says
/// PROCESSING, and no worker here is running it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvancedWhileProcessing;

impl ConflictRule for AdvancedWhileProcessing {
    fn name(&self) -> &'static str {
        "advanced-while-processing"
    }

    fn matches(&self, local: &Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> bool {
        persisted.version() == local.version() + 1
            && local.has_state(StateName::Processing)
            && !persisted.has_state(StateName::Processing)
            && !local.id().is_some_and(|id| ctx.directory.contains(id))
    }

    fn resolve(
        &self,
        _local: &mut Job,
        persisted: &Job,
        _ctx: &ResolutionContext<'_>,
    ) -> Resolution {
        Resolution::TakePersisted(persisted.clone())
    }
}

/// A retried job was enqueued here while the stored copy is still SCHEDULED
/// one version ahead (the retry schedule was re-saved concurrently).
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduledTooEarly;

impl ConflictRule for ScheduledTooEarly {
    fn name(&self) -> &'static str {
        "scheduled-too-early"
    }

    fn matches(&self, local: &Job, persisted: &Job, _ctx: &ResolutionContext<'_>) -> bool {
        local.has_state(StateName::Enqueued)
            && persisted.has_state(StateName::Scheduled)
            && local.version() + 1 == persisted.version()
            && local.has_failed_before()
    }

    fn resolve(
        &self,
        local: &mut Job,
        persisted: &Job,
        _ctx: &ResolutionContext<'_>,
    ) -> Resolution {
        local.restamp_version(persisted.version());
        Resolution::KeepLocal(local.clone())
    }
}

/// The host slept; whatever happened meanwhile elsewhere wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSlept;

impl ConflictRule for SystemSlept {
    fn name(&self) -> &'static str {
        "system-slept"
    }

    fn matches(&self, _local: &Job, _persisted: &Job, ctx: &ResolutionContext<'_>) -> bool {
        ctx.system_slept
    }

    fn resolve(&self, local: &mut Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> Resolution {
        ctx.interrupt_owner(local);
        Resolution::TakePersisted(persisted.clone())
    }
}
