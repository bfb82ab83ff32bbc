//! Job lifecycle states.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ServerId;

/// Discriminant of a [`JobState`], used for queries and transition checks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateName {
    Scheduled,
    Enqueued,
    Processing,
    Succeeded,
    Failed,
    Deleted,
}

impl StateName {
    pub const ALL: [StateName; 6] = [
        StateName::Scheduled,
        StateName::Enqueued,
        StateName::Processing,
        StateName::Succeeded,
        StateName::Failed,
        StateName::Deleted,
    ];

    /// States in which a job is still pending or running.
    pub const ACTIVE: [StateName; 3] = [
        StateName::Scheduled,
        StateName::Enqueued,
        StateName::Processing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StateName::Scheduled => "SCHEDULED",
            StateName::Enqueued => "ENQUEUED",
            StateName::Processing => "PROCESSING",
            StateName::Succeeded => "SUCCEEDED",
            StateName::Failed => "FAILED",
            StateName::Deleted => "DELETED",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    ///
    /// DELETED is terminal; every other state may be deleted. This is
    /// narrower than a plain "anything may be deleted" rule: DELETED to
    /// DELETED is rejected, so deleting an already deleted job is a no-op
    /// at the client rather than a second state entry.
    pub fn can_transition_to(self, to: StateName) -> bool {
        use StateName::*;
        match (self, to) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Scheduled, Enqueued)
            | (Enqueued, Processing)
            | (Processing, Succeeded)
            | (Processing, Failed)
            | (Failed, Scheduled)
            | (Failed, Enqueued) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for StateName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a job's state history.
///
/// Entries are immutable once appended, except the heartbeat (`updated_at`)
/// of a PROCESSING entry while it is the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Scheduled {
        scheduled_at: DateTime<Utc>,
        reason: Option<String>,
        created_at: DateTime<Utc>,
    },
    Enqueued {
        created_at: DateTime<Utc>,
    },
    Processing {
        server_id: ServerId,
        created_at: DateTime<Utc>,
        /// Last heartbeat.
        updated_at: DateTime<Utc>,
    },
    Succeeded {
        /// Time between being enqueued and starting to process.
        latency_ms: u64,
        processing_ms: u64,
        created_at: DateTime<Utc>,
    },
    Failed {
        message: String,
        cause: String,
        retryable: bool,
        created_at: DateTime<Utc>,
    },
    Deleted {
        reason: String,
        created_at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn name(&self) -> StateName {
        match self {
            JobState::Scheduled { .. } => StateName::Scheduled,
            JobState::Enqueued { .. } => StateName::Enqueued,
            JobState::Processing { .. } => StateName::Processing,
            JobState::Succeeded { .. } => StateName::Succeeded,
            JobState::Failed { .. } => StateName::Failed,
            JobState::Deleted { .. } => StateName::Deleted,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            JobState::Scheduled { created_at, .. }
            | JobState::Enqueued { created_at }
            | JobState::Processing { created_at, .. }
            | JobState::Succeeded { created_at, .. }
            | JobState::Failed { created_at, .. }
            | JobState::Deleted { created_at, .. } => *created_at,
        }
    }

    /// Latest timestamp of this entry (the heartbeat for PROCESSING).
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            JobState::Processing { updated_at, .. } => *updated_at,
            other => other.created_at(),
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let ts = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self {
            JobState::Scheduled {
                scheduled_at,
                reason,
                created_at,
            } => {
                write!(f, "SCHEDULED(at={}", ts(scheduled_at))?;
                if let Some(reason) = reason {
                    write!(f, ", reason={reason}")?;
                }
                write!(f, ")@{}", ts(created_at))
            }
            JobState::Enqueued { created_at } => write!(f, "ENQUEUED@{}", ts(created_at)),
            JobState::Processing {
                server_id,
                created_at,
                updated_at,
            } => write!(
                f,
                "PROCESSING(server={server_id}, heartbeat={})@{}",
                ts(updated_at),
                ts(created_at)
            ),
            JobState::Succeeded {
                latency_ms,
                processing_ms,
                created_at,
            } => write!(
                f,
                "SUCCEEDED(latency={latency_ms}ms, processing={processing_ms}ms)@{}",
                ts(created_at)
            ),
            JobState::Failed {
                message,
                retryable,
                created_at,
                ..
            } => write!(
                f,
                "FAILED(message={message}, retryable={retryable})@{}",
                ts(created_at)
            ),
            JobState::Deleted { reason, created_at } => {
                write!(f, "DELETED(reason={reason})@{}", ts(created_at))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_is_terminal() {
        for to in StateName::ALL {
            assert!(!StateName::Deleted.can_transition_to(to));
        }
    }

    #[test]
    fn deleting_twice_is_rejected() {
        assert!(!StateName::Deleted.can_transition_to(StateName::Deleted));
    }

    #[test]
    fn everything_else_can_be_deleted() {
        for from in StateName::ALL.into_iter().filter(|s| *s != StateName::Deleted) {
            assert!(from.can_transition_to(StateName::Deleted), "{from}");
        }
    }

    #[test]
    fn forward_path_is_legal() {
        assert!(StateName::Scheduled.can_transition_to(StateName::Enqueued));
        assert!(StateName::Enqueued.can_transition_to(StateName::Processing));
        assert!(StateName::Processing.can_transition_to(StateName::Succeeded));
        assert!(StateName::Processing.can_transition_to(StateName::Failed));
        assert!(StateName::Failed.can_transition_to(StateName::Scheduled));

        assert!(!StateName::Succeeded.can_transition_to(StateName::Enqueued));
        assert!(!StateName::Processing.can_transition_to(StateName::Processing));
        assert!(!StateName::Scheduled.can_transition_to(StateName::Processing));
    }

    #[test]
    fn serializes_with_uppercase_tag() {
        let state = JobState::Enqueued {
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "ENQUEUED");

        let back: JobState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
