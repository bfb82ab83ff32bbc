use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use jobweave_core::{Job, JobDetail, JobId, JobState, ServerId, StateName};

use super::*;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn persisted_job(job: Job, version: u64) -> Job {
    let mut job = job;
    job.assign_id(JobId::new());
    job.restamp_version(version);
    job.mark_saved();
    job
}

fn enqueued_base() -> Job {
    persisted_job(Job::enqueued(JobDetail::handler("noop"), t(0)), 0)
}

fn ctx(directory: &WorkerDirectory, system_slept: bool) -> ResolutionContext<'_> {
    ResolutionContext {
        directory,
        system_slept,
        now: t(100),
    }
}

fn resolve(
    local: &mut Job,
    persisted: Option<&Job>,
    ctx: &ResolutionContext<'_>,
) -> Option<Resolution> {
    ConflictResolver::new().resolve_one(local, persisted, ctx)
}

fn taken(resolution: Option<Resolution>) -> Job {
    match resolution {
        Some(Resolution::TakePersisted(job)) => job,
        other => panic!("expected TakePersisted, got {other:?}"),
    }
}

#[test]
fn rules_are_ordered() {
    assert_eq!(
        ConflictResolver::new().rule_names(),
        vec![
            "deleted-while-processing",
            "deleted-while-idle",
            "succeeded-while-processing",
            "failed-while-processing",
            "ran-on-another-server",
            "advanced-while-processing",
            "scheduled-too-early",
            "system-slept",
        ]
    );
}

#[test]
fn deleted_while_processing_takes_persisted_and_interrupts() {
    let directory = WorkerDirectory::new();
    let base = enqueued_base();

    let mut local = base.clone();
    local.start_processing(ServerId::new(), t(1)).unwrap();
    local.restamp_version(1);

    let mut persisted = local.clone();
    persisted.delete("by operator", t(2)).unwrap();
    persisted.restamp_version(2);

    let token = CancellationToken::new();
    let _lease = directory.register(
        local.id().unwrap(),
        Arc::new(Mutex::new(local.clone())),
        token.clone(),
    );

    let winner = taken(resolve(&mut local, Some(&persisted), &ctx(&directory, false)));

    assert_eq!(winner.state_name(), StateName::Deleted);
    assert_eq!(local.state_name(), StateName::Deleted);
    assert!(token.is_cancelled());
}

#[test]
fn deleted_while_idle_takes_persisted() {
    let directory = WorkerDirectory::new();
    let base = persisted_job(Job::scheduled(JobDetail::handler("noop"), t(10), t(0)), 0);

    let mut local = base.clone();
    local.enqueue(t(10)).unwrap();

    let mut persisted = base.clone();
    persisted.delete("by operator", t(5)).unwrap();
    persisted.restamp_version(1);

    let winner = taken(resolve(&mut local, Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.state_name(), StateName::Deleted);
    assert_eq!(local.state_name(), StateName::Enqueued);
}

#[test]
fn deleted_on_both_sides_is_unresolvable_with_both_histories() {
    let directory = WorkerDirectory::new();
    let base = enqueued_base();

    let mut local = base.clone();
    local.delete("local cleanup", t(1)).unwrap();
    let mut persisted = base.clone();
    persisted.delete("remote cleanup", t(2)).unwrap();
    persisted.restamp_version(1);

    let err = ConflictResolver::new()
        .resolve_batch(
            std::slice::from_mut(&mut local),
            &[Some(persisted.clone())],
            &ctx(&directory, false),
        )
        .unwrap_err();

    assert_eq!(err.conflicts.len(), 1);
    let diagnostic = &err.conflicts[0];
    assert_eq!(diagnostic.job_id, base.id());
    assert_eq!(diagnostic.local, local.render_history());
    assert_eq!(diagnostic.persisted, persisted.render_history());
    let message = err.to_string();
    assert!(message.contains("local cleanup"));
    assert!(message.contains("remote cleanup"));
}

#[test]
fn succeeded_on_both_sides_is_unresolvable() {
    let directory = WorkerDirectory::new();
    let mut base = enqueued_base();
    base.start_processing(ServerId::new(), t(1)).unwrap();

    let mut local = base.clone();
    local.succeed(Default::default(), Default::default(), t(2)).unwrap();
    let mut persisted = base.clone();
    persisted.succeed(Default::default(), Default::default(), t(3)).unwrap();
    persisted.restamp_version(1);

    assert!(resolve(&mut local, Some(&persisted), &ctx(&directory, false)).is_none());
}

#[test]
fn succeeded_while_processing_takes_persisted() {
    let directory = WorkerDirectory::new();
    let mut local = enqueued_base();
    local.start_processing(ServerId::new(), t(1)).unwrap();

    let mut persisted = local.clone();
    persisted.succeed(Default::default(), Default::default(), t(5)).unwrap();
    persisted.restamp_version(1);

    let winner = taken(resolve(&mut local, Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.state_name(), StateName::Succeeded);
}

#[test]
fn failed_while_processing_takes_persisted_retry() {
    let directory = WorkerDirectory::new();
    let server = ServerId::new();
    let mut local = enqueued_base();
    local.start_processing(server, t(1)).unwrap();
    local.restamp_version(1);

    // Another process declared it orphaned, and its retry filter rescheduled it.
    let mut persisted = local.clone();
    persisted.fail("orphaned", "no heartbeat", true, t(60)).unwrap();
    persisted.schedule_at(t(70), "Retry 1 of 10", t(60)).unwrap();
    persisted.restamp_version(2);

    let winner = taken(resolve(&mut local, Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.state_name(), StateName::Scheduled);
}

#[test]
fn ran_on_another_server_takes_persisted() {
    let directory = WorkerDirectory::new();
    let mut local = enqueued_base();
    local.start_processing(ServerId::new(), t(1)).unwrap();
    local.restamp_version(1);

    let mut persisted = local.clone();
    persisted.fail("orphaned", "no heartbeat", true, t(60)).unwrap();
    persisted.enqueue(t(61)).unwrap();
    persisted.start_processing(ServerId::new(), t(62)).unwrap();
    persisted.restamp_version(4);

    let winner = taken(resolve(&mut local, Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.state_name(), StateName::Processing);
    assert_ne!(winner.last_processing_owner(), local.last_processing_owner());
}

#[test]
fn advanced_while_processing_requires_no_local_owner() {
    let base = persisted_job(Job::scheduled(JobDetail::handler("noop"), t(10), t(0)), 0);

    // Stale copy claims PROCESSING; storage moved one save ahead elsewhere.
    let mut local = base.clone();
    local.enqueue(t(10)).unwrap();
    local.start_processing(ServerId::new(), t(11)).unwrap();
    let mut persisted = base.clone();
    persisted.enqueue(t(10)).unwrap();
    persisted.restamp_version(1);

    let directory = WorkerDirectory::new();
    let winner = taken(resolve(&mut local.clone(), Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.state_name(), StateName::Enqueued);

    let _lease = directory.register(
        local.id().unwrap(),
        Arc::new(Mutex::new(local.clone())),
        CancellationToken::new(),
    );
    assert!(resolve(&mut local, Some(&persisted), &ctx(&directory, false)).is_none());
}

#[test]
fn scheduled_too_early_keeps_local_with_restamped_version() {
    let directory = WorkerDirectory::new();
    let mut base = enqueued_base();
    base.start_processing(ServerId::new(), t(1)).unwrap();
    base.fail("boom", "boom", true, t(2)).unwrap();
    base.schedule_at(t(12), "Retry 1 of 10", t(2)).unwrap();
    base.restamp_version(3);

    let mut local = base.clone();
    local.enqueue(t(12)).unwrap();
    let persisted = {
        let mut p = base.clone();
        p.restamp_version(4);
        p
    };

    match resolve(&mut local, Some(&persisted), &ctx(&directory, false)) {
        Some(Resolution::KeepLocal(job)) => {
            assert_eq!(job.version(), 4);
            assert_eq!(job.state_name(), StateName::Enqueued);
        }
        other => panic!("expected KeepLocal, got {other:?}"),
    }
    assert_eq!(local.version(), 4);
}

#[test]
fn system_slept_is_the_last_resort() {
    let directory = WorkerDirectory::new();
    let base = persisted_job(Job::scheduled(JobDetail::handler("noop"), t(10), t(0)), 0);

    let mut local = base.clone();
    local.enqueue(t(10)).unwrap();
    let mut persisted = base.clone();
    persisted.enqueue(t(10)).unwrap();
    persisted.start_processing(ServerId::new(), t(11)).unwrap();
    persisted.restamp_version(1);

    assert!(resolve(&mut local.clone(), Some(&persisted), &ctx(&directory, false)).is_none());

    let winner = taken(resolve(&mut local, Some(&persisted), &ctx(&directory, true)));
    assert_eq!(winner.state_name(), StateName::Processing);
}

#[test]
fn purged_job_is_gone_and_owner_interrupted() {
    let directory = WorkerDirectory::new();
    let mut local = enqueued_base();
    local.start_processing(ServerId::new(), t(1)).unwrap();
    let token = CancellationToken::new();
    let _lease = directory.register(
        local.id().unwrap(),
        Arc::new(Mutex::new(local.clone())),
        token.clone(),
    );

    let resolution = resolve(&mut local, None, &ctx(&directory, false));

    assert!(matches!(resolution, Some(Resolution::Gone)));
    assert!(token.is_cancelled());
}

#[test]
fn resolution_is_deterministic() {
    let directory = WorkerDirectory::new();
    let mut local = enqueued_base();
    local.start_processing(ServerId::new(), t(1)).unwrap();
    let mut persisted = local.clone();
    persisted.succeed(Default::default(), Default::default(), t(5)).unwrap();
    persisted.restamp_version(1);

    let first = taken(resolve(&mut local.clone(), Some(&persisted), &ctx(&directory, false)));
    let second = taken(resolve(&mut local.clone(), Some(&persisted), &ctx(&directory, false)));

    assert_eq!(first.history(), second.history());
    assert_eq!(first.version(), second.version());
}

#[test]
fn failed_while_processing_ignores_unrelated_failures() {
    // Persisted FAILED happened during an earlier run, not the one local is in.
    let server = ServerId::new();
    let mut earlier = enqueued_base();
    earlier.start_processing(server, t(1)).unwrap();
    earlier.fail("boom", "boom", true, t(2)).unwrap();

    let mut local = earlier.clone();
    local.enqueue(t(3)).unwrap();
    local.start_processing(server, t(4)).unwrap();

    assert!(!FailedWhileProcessing.matches(
        &local,
        &earlier,
        &ctx(&WorkerDirectory::new(), false)
    ));
    assert!(matches!(earlier.state(), JobState::Failed { .. }));
}

#[test]
fn finished_run_loses_to_an_orphan_retry_of_the_same_run() {
    let directory = WorkerDirectory::new();
    let server = ServerId::new();
    let mut claimed = enqueued_base();
    claimed.start_processing(server, t(1)).unwrap();
    claimed.restamp_version(1);
    claimed.mark_saved();

    let mut persisted = claimed.clone();
    persisted.fail("orphaned", "no heartbeat", true, t(60)).unwrap();
    persisted.schedule_at(t(70), "Retry 1 of 10", t(60)).unwrap();
    persisted.restamp_version(2);

    let mut succeeded = claimed.clone();
    succeeded.succeed(Default::default(), Default::default(), t(65)).unwrap();
    let winner = taken(resolve(&mut succeeded, Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.state_name(), StateName::Scheduled);
    assert_eq!(winner.version(), 2);

    // A failed run already rescheduled by the retry filter.
    let mut retried = claimed.clone();
    retried.fail("boom", "boom", true, t(65)).unwrap();
    retried.schedule_at(t(75), "Retry 1 of 10", t(65)).unwrap();
    let winner = taken(resolve(&mut retried, Some(&persisted), &ctx(&directory, false)));
    assert_eq!(winner.history(), persisted.history());
}

#[test]
fn saved_outcome_of_an_earlier_run_is_not_the_current_run() {
    let server = ServerId::new();
    let mut local = enqueued_base();
    local.start_processing(server, t(1)).unwrap();
    local.succeed(Default::default(), Default::default(), t(2)).unwrap();
    local.restamp_version(2);
    local.mark_saved();

    let mut persisted = local.clone();
    persisted.restamp_version(3);

    assert!(!FailedWhileProcessing.matches(
        &local,
        &persisted,
        &ctx(&WorkerDirectory::new(), false)
    ));
}
