//! Domain error model.

use thiserror::Error;

use crate::state::StateName;

/// Result type used across the job model.
pub type JobResult<T> = Result<T, JobStateError>;

/// Job-model error.
///
/// Keep this focused on deterministic failures of in-memory state transitions.
/// Storage and orchestration concerns belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobStateError {
    /// The requested transition is not part of the job lifecycle.
    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: StateName, to: StateName },

    /// `start_processing` was called on a job that is already PROCESSING.
    ///
    /// This points at a double dispatch inside one process.
    #[error("job is already processing on server {0}")]
    AlreadyProcessing(crate::ServerId),

    /// `heartbeat` was called while the job is not PROCESSING (completion raced it).
    #[error("job is not processing (current state: {0})")]
    NotProcessing(StateName),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl JobStateError {
    pub fn illegal(from: StateName, to: StateName) -> Self {
        Self::IllegalTransition { from, to }
    }
}

/// Recurring schedule error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),

    #[error("interval must be at least one second")]
    IntervalTooShort,
}
