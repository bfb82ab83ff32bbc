//! Demo handlers and seed jobs for a single-process run on the in-memory store.

use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Duration as ChronoDuration;
use serde_json::json;
use tracing::info;

use jobweave_core::{JobDetail, RecurringJob, Schedule};
use jobweave_infra::JobScheduler;
use jobweave_infra::workers::{HandlerRegistry, JobContext, PermanentFailure};

pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_fn("email.send", |ctx: JobContext| async move {
            let to = ctx.args["to"].as_str().context("missing recipient")?.to_string();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = ctx.cancellation.cancelled() => bail!("cancelled while sending to {to}"),
            }
            info!(job_id = %ctx.job_id, to = %to, "email sent");
            Ok(())
        })
        .with_fn("report.*", |ctx: JobContext| async move {
            if ctx.args["fail"].as_bool().unwrap_or(false) {
                bail!("report source unavailable");
            }
            info!(job_id = %ctx.job_id, report = %ctx.handler, "report built");
            Ok(())
        })
        .with_fn("import.csv", |ctx: JobContext| async move {
            let Some(path) = ctx.args["path"].as_str() else {
                return Err(PermanentFailure("no input path".into()).into());
            };
            info!(job_id = %ctx.job_id, path, "import finished");
            Ok(())
        })
        .with_fn("*", |ctx: JobContext| async move {
            info!(job_id = %ctx.job_id, handler = %ctx.handler, args = %ctx.args, "ran job");
            Ok(())
        })
}

/// Enqueue a handful of jobs and register a recurring one.
pub async fn seed(scheduler: &JobScheduler) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    scheduler
        .enqueue(JobDetail::new("email.send", json!({ "to": "ops@example.com" })))
        .await?;
    scheduler
        .enqueue(JobDetail::new("report.daily", json!({ "fail": true })))
        .await?;
    scheduler
        .enqueue(JobDetail::new("import.csv", json!({})))
        .await?;
    scheduler
        .schedule(
            JobDetail::new("report.weekly", json!({ "week": 42 })),
            now + ChronoDuration::seconds(30),
        )
        .await?;

    let recurring = RecurringJob::new(
        JobDetail::handler("cache.warm"),
        Schedule::cron("0 * * * * *")?,
        now,
    )?
    .with_name("warm caches every minute");
    scheduler.create_recurring(recurring).await?;

    let stats = scheduler.stats().await?;
    info!(
        enqueued = stats.enqueued,
        scheduled = stats.scheduled,
        recurring = stats.recurring_jobs,
        "seeded demo jobs"
    );
    Ok(())
}
