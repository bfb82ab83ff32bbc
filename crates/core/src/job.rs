//! The versioned job entity and its invocation descriptor.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{JobResult, JobStateError};
use crate::id::{JobId, ServerId};
use crate::state::{JobState, StateName};

/// What to run: a handler name plus JSON arguments.
///
/// The engine never interprets this; it is handed to whatever resolves handler
/// names into code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetail {
    pub handler: String,
    #[serde(default)]
    pub args: JsonValue,
}

impl JobDetail {
    pub fn new(handler: impl Into<String>, args: JsonValue) -> Self {
        Self {
            handler: handler.into(),
            args,
        }
    }

    /// A detail without arguments.
    pub fn handler(handler: impl Into<String>) -> Self {
        Self::new(handler, JsonValue::Null)
    }

    /// Deterministic signature: `handler(args-json)`.
    ///
    /// `serde_json` keeps object keys ordered, so equal details always yield
    /// equal signatures.
    pub fn signature(&self) -> String {
        match &self.args {
            JsonValue::Null => format!("{}()", self.handler),
            args => format!("{}({})", self.handler, args),
        }
    }
}

/// A unit of work with a versioned, append-only state history.
///
/// The current state is always the last history entry. The history is never
/// empty; constructors take the initial state and deserialization rejects
/// empty histories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "JobRecord")]
pub struct Job {
    id: Option<JobId>,
    version: u64,
    name: String,
    detail: JobDetail,
    priority: i32,
    recurring_job_id: Option<String>,
    metadata: BTreeMap<String, JsonValue>,
    created_at: DateTime<Utc>,
    history: Vec<JobState>,
    /// States appended since the last durable save. Never persisted.
    #[serde(skip)]
    unsaved_state_changes: usize,
}

/// Wire shape of [`Job`], validated on the way in.
#[derive(Deserialize)]
struct JobRecord {
    id: Option<JobId>,
    version: u64,
    name: String,
    detail: JobDetail,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    recurring_job_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, JsonValue>,
    created_at: DateTime<Utc>,
    history: Vec<JobState>,
}

impl TryFrom<JobRecord> for Job {
    type Error = String;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        if r.history.is_empty() {
            return Err("job history must not be empty".to_string());
        }
        Ok(Self {
            id: r.id,
            version: r.version,
            name: r.name,
            detail: r.detail,
            priority: r.priority,
            recurring_job_id: r.recurring_job_id,
            metadata: r.metadata,
            created_at: r.created_at,
            history: r.history,
            unsaved_state_changes: 0,
        })
    }
}

impl Job {
    /// Create a not-yet-persisted job starting in `initial`.
    pub fn new(detail: JobDetail, initial: JobState) -> Self {
        let created_at = initial.created_at();
        Self {
            id: None,
            version: 0,
            name: detail.handler.clone(),
            detail,
            priority: 0,
            recurring_job_id: None,
            metadata: BTreeMap::new(),
            created_at,
            history: vec![initial],
            unsaved_state_changes: 1,
        }
    }

    /// Create a job that is ready to run.
    pub fn enqueued(detail: JobDetail, now: DateTime<Utc>) -> Self {
        Self::new(detail, JobState::Enqueued { created_at: now })
    }

    /// Create a job that becomes due at `at`.
    pub fn scheduled(detail: JobDetail, at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::new(
            detail,
            JobState::Scheduled {
                scheduled_at: at,
                reason: None,
                created_at: now,
            },
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn with_recurring_job_id(mut self, id: impl Into<String>) -> Self {
        self.recurring_job_id = Some(id.into());
        self
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    /// True until a storage provider has assigned an id.
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn detail(&self) -> &JobDetail {
        &self.detail
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn recurring_job_id(&self) -> Option<&str> {
        self.recurring_job_id.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, JsonValue> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, JsonValue> {
        &mut self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn state(&self) -> &JobState {
        // Non-empty by construction.
        &self.history[self.history.len() - 1]
    }

    pub fn state_name(&self) -> StateName {
        self.state().name()
    }

    pub fn has_state(&self, name: StateName) -> bool {
        self.state_name() == name
    }

    /// Timestamp of the current state (the heartbeat while PROCESSING).
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state().updated_at()
    }

    pub fn failure_count(&self) -> usize {
        self.history
            .iter()
            .filter(|s| matches!(s, JobState::Failed { .. }))
            .count()
    }

    /// Whether any FAILED entry exists before the current state.
    pub fn has_failed_before(&self) -> bool {
        self.history[..self.history.len() - 1]
            .iter()
            .any(|s| matches!(s, JobState::Failed { .. }))
    }

    /// Owner recorded by the most recent PROCESSING entry, if any.
    pub fn last_processing_owner(&self) -> Option<ServerId> {
        self.history.iter().rev().find_map(|s| match s {
            JobState::Processing { server_id, .. } => Some(*server_id),
            _ => None,
        })
    }

    /// When the job was last enqueued.
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find_map(|s| match s {
            JobState::Enqueued { created_at } => Some(*created_at),
            _ => None,
        })
    }

    /// The instant the job was originally scheduled for, if it started SCHEDULED.
    pub fn first_scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self.history.first() {
            Some(JobState::Scheduled { scheduled_at, .. }) => Some(*scheduled_at),
            _ => None,
        }
    }

    /// Instant a SCHEDULED job becomes due.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self.state() {
            JobState::Scheduled { scheduled_at, .. } => Some(*scheduled_at),
            _ => None,
        }
    }

    pub fn enqueue(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobState::Enqueued { created_at: now })
    }

    pub fn schedule_at(
        &mut self,
        at: DateTime<Utc>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        self.transition(JobState::Scheduled {
            scheduled_at: at,
            reason: Some(reason.into()),
            created_at: now,
        })
    }

    /// Claim the job for `server_id`.
    ///
    /// Fails with [`JobStateError::AlreadyProcessing`] if the job is already
    /// PROCESSING.
    pub fn start_processing(&mut self, server_id: ServerId, now: DateTime<Utc>) -> JobResult<()> {
        if let JobState::Processing { server_id, .. } = self.state() {
            return Err(JobStateError::AlreadyProcessing(*server_id));
        }
        self.transition(JobState::Processing {
            server_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Refresh the heartbeat of the current PROCESSING entry in place.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        let current = self.state_name();
        match self.history.last_mut() {
            Some(JobState::Processing { updated_at, .. }) => {
                *updated_at = now;
                Ok(())
            }
            _ => Err(JobStateError::NotProcessing(current)),
        }
    }

    pub fn succeed(
        &mut self,
        latency: Duration,
        processing: Duration,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        self.transition(JobState::Succeeded {
            latency_ms: duration_ms(latency),
            processing_ms: duration_ms(processing),
            created_at: now,
        })
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        cause: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        self.transition(JobState::Failed {
            message: message.into(),
            cause: cause.into(),
            retryable,
            created_at: now,
        })
    }

    pub fn delete(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobState::Deleted {
            reason: reason.into(),
            created_at: now,
        })
    }

    /// Bump the version ahead of a save; returns the previous value for rollback.
    pub fn increase_version(&mut self) -> u64 {
        let previous = self.version;
        self.version += 1;
        previous
    }

    /// Overwrite the version.
    ///
    /// Used by rollbacks and by conflict rules that re-stamp a local job with
    /// the persisted version before re-saving it.
    pub fn restamp_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Record the id assigned by a storage provider on first save.
    pub fn assign_id(&mut self, id: JobId) {
        self.id = Some(id);
    }

    pub(crate) fn clear_id(&mut self) {
        self.id = None;
    }

    pub fn has_unsaved_state_changes(&self) -> bool {
        self.unsaved_state_changes > 0
    }

    /// Number of trailing history entries appended since the last durable save.
    pub fn unsaved_state_changes(&self) -> usize {
        self.unsaved_state_changes
    }

    /// Forget pending state changes after a durable save.
    pub fn mark_saved(&mut self) {
        self.unsaved_state_changes = 0;
    }

    /// Human-readable rendering of version and full history, for diagnostics.
    pub fn render_history(&self) -> String {
        let id = self
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<new>".to_string());
        let states: Vec<String> = self.history.iter().map(ToString::to_string).collect();
        format!("job {id} v{}: [{}]", self.version, states.join(" -> "))
    }

    fn transition(&mut self, next: JobState) -> JobResult<()> {
        let from = self.state_name();
        let to = next.name();
        if !from.can_transition_to(to) {
            return Err(JobStateError::illegal(from, to));
        }
        self.history.push(next);
        self.unsaved_state_changes += 1;
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn detail() -> JobDetail {
        JobDetail::new("mail.send", serde_json::json!({"to": "ops@example.com"}))
    }

    #[test]
    fn full_lifecycle_appends_states() {
        let server = ServerId::new();
        let mut job = Job::scheduled(detail(), t(10), t(0));

        job.enqueue(t(10)).unwrap();
        job.start_processing(server, t(11)).unwrap();
        job.heartbeat(t(12)).unwrap();
        job.succeed(Duration::from_secs(1), Duration::from_secs(2), t(13))
            .unwrap();

        let names: Vec<_> = job.history().iter().map(JobState::name).collect();
        assert_eq!(
            names,
            vec![
                StateName::Scheduled,
                StateName::Enqueued,
                StateName::Processing,
                StateName::Succeeded
            ]
        );
        assert_eq!(job.state_name(), StateName::Succeeded);
        assert_eq!(job.last_processing_owner(), Some(server));
        assert_eq!(job.unsaved_state_changes(), 4);
    }

    #[test]
    fn heartbeat_mutates_in_place() {
        let mut job = Job::enqueued(detail(), t(0));
        job.start_processing(ServerId::new(), t(1)).unwrap();
        let len = job.history().len();

        job.heartbeat(t(30)).unwrap();

        assert_eq!(job.history().len(), len);
        assert_eq!(job.updated_at(), t(30));
    }

    #[test]
    fn heartbeat_after_completion_is_reported_not_applied() {
        let mut job = Job::enqueued(detail(), t(0));
        job.start_processing(ServerId::new(), t(1)).unwrap();
        job.succeed(Duration::ZERO, Duration::ZERO, t(2)).unwrap();

        let err = job.heartbeat(t(3)).unwrap_err();

        assert_eq!(err, JobStateError::NotProcessing(StateName::Succeeded));
        assert_eq!(job.updated_at(), t(2));
    }

    #[test]
    fn double_dispatch_is_rejected() {
        let first = ServerId::new();
        let mut job = Job::enqueued(detail(), t(0));
        job.start_processing(first, t(1)).unwrap();

        let err = job.start_processing(ServerId::new(), t(2)).unwrap_err();

        assert_eq!(err, JobStateError::AlreadyProcessing(first));
        assert_eq!(job.history().len(), 2);
    }

    #[test]
    fn illegal_transition_leaves_history_untouched() {
        let mut job = Job::enqueued(detail(), t(0));

        let err = job
            .succeed(Duration::ZERO, Duration::ZERO, t(1))
            .unwrap_err();

        assert_eq!(
            err,
            JobStateError::illegal(StateName::Enqueued, StateName::Succeeded)
        );
        assert_eq!(job.history().len(), 1);
    }

    #[test]
    fn increase_version_returns_previous() {
        let mut job = Job::enqueued(detail(), t(0));
        assert_eq!(job.increase_version(), 0);
        assert_eq!(job.increase_version(), 1);
        assert_eq!(job.version(), 2);
    }

    #[test]
    fn retry_path_counts_failures() {
        let mut job = Job::enqueued(detail(), t(0));
        job.start_processing(ServerId::new(), t(1)).unwrap();
        job.fail("boom", "io error", true, t(2)).unwrap();
        assert!(!job.has_failed_before());

        job.schedule_at(t(10), "Retry 1 of 3", t(2)).unwrap();
        job.enqueue(t(10)).unwrap();

        assert_eq!(job.failure_count(), 1);
        assert!(job.has_failed_before());
        assert_eq!(job.enqueued_at(), Some(t(10)));
    }

    #[test]
    fn signature_is_deterministic() {
        let a = JobDetail::new("report", serde_json::json!({"b": 1, "a": 2}));
        let b = JobDetail::new("report", serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a.signature(), b.signature());
        assert_eq!(JobDetail::handler("tick").signature(), "tick()");
    }

    #[test]
    fn deserialization_rejects_empty_history() {
        let mut json = serde_json::to_value(Job::enqueued(detail(), t(0))).unwrap();
        json["history"] = serde_json::json!([]);
        assert!(serde_json::from_value::<Job>(json).is_err());
    }

    #[test]
    fn deserialized_job_has_no_unsaved_changes() {
        let job = Job::enqueued(detail(), t(0)).with_priority(7);
        let back: Job = serde_json::from_value(serde_json::to_value(&job).unwrap()).unwrap();
        assert!(!back.has_unsaved_state_changes());
        assert_eq!(back.priority(), 7);
        assert_eq!(back.history(), job.history());
    }

    #[test]
    fn render_history_lists_every_state() {
        let mut job = Job::enqueued(detail(), t(0));
        job.delete("cleanup", t(1)).unwrap();
        let rendered = job.render_history();
        assert!(rendered.starts_with("job <new> v0: [ENQUEUED@"));
        assert!(rendered.contains("-> DELETED(reason=cleanup)"));
    }
}
