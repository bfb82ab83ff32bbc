use thiserror::Error;

use jobweave_core::ScheduleError;

use crate::conflict::UnresolvableConflictError;
use crate::server::config::ConfigError;
use crate::storage::StorageError;

/// Background job server error.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    UnresolvableConflict(#[from] UnresolvableConflictError),

    #[error("{remaining} job(s) still conflicted after {rounds} save rounds")]
    ConflictRoundsExhausted { remaining: usize, rounds: usize },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("background job server task failed: {0}")]
    Join(String),
}

impl ServerError {
    /// Errors after which this process must not keep mutating jobs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::UnresolvableConflict(_))
    }
}
