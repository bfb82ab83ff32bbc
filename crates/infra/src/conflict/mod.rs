//! Reconciliation of locally mutated jobs with concurrently modified persisted ones.
//!
//! When a versioned save rejects a job, the save path fetches the persisted copy
//! and asks the [`ConflictResolver`] what to do. Rules are tried in order and
//! the first match decides. A conflict no rule matches is unresolvable: it
//! means two processes disagree about a job in a way that cannot be explained
//! by normal races, and the caller treats it as fatal.

mod rules;

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobweave_core::{Job, JobId, StateName};

use crate::workers::WorkerDirectory;

pub use rules::{
    AdvancedWhileProcessing, DeletedWhileIdle, DeletedWhileProcessing, FailedWhileProcessing,
    RanOnAnotherServer, ScheduledTooEarly, SucceededWhileProcessing, SystemSlept,
};

/// Process-local facts the rules may consult.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub directory: &'a WorkerDirectory,
    /// The loop detected a host clock gap in the current cycle.
    pub system_slept: bool,
    pub now: DateTime<Utc>,
}

impl ResolutionContext<'_> {
    /// Interrupt the local worker of `local` if it was processing here.
    pub fn interrupt_owner(&self, local: &Job) {
        if !local.has_state(StateName::Processing) {
            return;
        }
        if let Some(id) = local.id() {
            if self.directory.interrupt(id) {
                tracing::info!(job_id = %id, "interrupted worker of job modified elsewhere");
            }
        }
    }
}

/// Outcome for one conflicting job.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Re-save the local copy (its version was re-stamped).
    KeepLocal(Job),
    /// Discard local changes; the persisted copy wins.
    TakePersisted(Job),
    /// The job no longer exists in storage.
    Gone,
}

pub trait ConflictRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, local: &Job, persisted: &Job, ctx: &ResolutionContext<'_>) -> bool;

    fn resolve(&self, local: &mut Job, persisted: &Job, ctx: &ResolutionContext<'_>)
    -> Resolution;
}

/// Both sides of a conflict no rule could explain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDiagnostic {
    pub job_id: Option<JobId>,
    pub local: String,
    pub persisted: String,
}

impl core::fmt::Display for ConflictDiagnostic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "local {} / persisted {}", self.local, self.persisted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "unresolvable concurrent modification of {} job(s): {}",
    .conflicts.len(),
    render(.conflicts)
)]
pub struct UnresolvableConflictError {
    pub conflicts: Vec<ConflictDiagnostic>,
}

fn render(conflicts: &[ConflictDiagnostic]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ordered list of conflict rules.
pub struct ConflictResolver {
    rules: Vec<Box<dyn ConflictRule>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::with_rules(vec![
            Box::new(DeletedWhileProcessing),
            Box::new(DeletedWhileIdle),
            Box::new(SucceededWhileProcessing),
            Box::new(FailedWhileProcessing),
            Box::new(RanOnAnotherServer),
            Box::new(AdvancedWhileProcessing),
            Box::new(ScheduledTooEarly),
            Box::new(SystemSlept),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn ConflictRule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Resolve a single conflict; `None` if no rule matches.
    pub fn resolve_one(
        &self,
        local: &mut Job,
        persisted: Option<&Job>,
        ctx: &ResolutionContext<'_>,
    ) -> Option<Resolution> {
        let Some(persisted) = persisted else {
            ctx.interrupt_owner(local);
            return Some(Resolution::Gone);
        };
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.matches(local, persisted, ctx))?;
        tracing::debug!(
            job_id = ?local.id(),
            rule = rule.name(),
            local = %local.state_name(),
            persisted = %persisted.state_name(),
            "resolving concurrent modification"
        );
        Some(rule.resolve(local, persisted, ctx))
    }

    /// Resolve every conflict of a batch.
    ///
    /// `persisted[i]` is the stored copy of `locals[i]` (`None` if purged).
    /// Results are in input order. If any conflict is unresolvable the whole
    /// batch fails with diagnostics for every unresolved job.
    pub fn resolve_batch(
        &self,
        locals: &mut [Job],
        persisted: &[Option<Job>],
        ctx: &ResolutionContext<'_>,
    ) -> Result<Vec<Resolution>, UnresolvableConflictError> {
        let mut resolutions = Vec::with_capacity(locals.len());
        let mut conflicts = Vec::new();

        for (local, persisted) in locals.iter_mut().zip(persisted) {
            match self.resolve_one(local, persisted.as_ref(), ctx) {
                Some(resolution) => resolutions.push(resolution),
                None => conflicts.push(ConflictDiagnostic {
                    job_id: local.id(),
                    local: local.render_history(),
                    persisted: persisted
                        .as_ref()
                        .map(Job::render_history)
                        .unwrap_or_default(),
                }),
            }
        }

        if conflicts.is_empty() {
            Ok(resolutions)
        } else {
            Err(UnresolvableConflictError { conflicts })
        }
    }
}

impl core::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("rules", &self.rule_names())
            .finish()
    }
}

#[cfg(test)]
mod tests;
