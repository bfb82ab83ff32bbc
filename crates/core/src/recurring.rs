//! Recurring job definitions and deterministic occurrence generation.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::job::{Job, JobDetail};

/// When a recurring job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Six or seven field cron expression, seconds first.
    Cron { expression: String },
    /// Fixed period anchored at the definition's `created_at`.
    Interval { every_secs: u64 },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        parse_cron(&expression)?;
        Ok(Self::Cron { expression })
    }

    pub fn every(period: Duration) -> Result<Self, ScheduleError> {
        let every_secs = period.as_secs();
        if every_secs == 0 {
            return Err(ScheduleError::IntervalTooShort);
        }
        Ok(Self::Interval { every_secs })
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
            Schedule::Interval { every_secs: 0 } => Err(ScheduleError::IntervalTooShort),
            Schedule::Interval { .. } => Ok(()),
        }
    }
}

impl core::fmt::Display for Schedule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Schedule::Cron { expression } => f.write_str(expression),
            Schedule::Interval { every_secs } => write!(f, "every {every_secs}s"),
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn parse_zone(zone_id: &str) -> Result<Tz, ScheduleError> {
    zone_id
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimeZone(zone_id.to_string()))
}

/// A job template plus the schedule that produces its instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringJob {
    /// Stable identifier; defaults to the detail signature.
    pub id: String,
    pub name: String,
    pub detail: JobDetail,
    pub schedule: Schedule,
    /// IANA time zone the schedule is evaluated in.
    pub zone_id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl RecurringJob {
    pub fn new(
        detail: JobDetail,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        schedule.validate()?;
        Ok(Self {
            id: detail.signature(),
            name: detail.handler.clone(),
            detail,
            schedule,
            zone_id: "UTC".to_string(),
            priority: 0,
            created_at: now,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_zone_id(mut self, zone_id: impl Into<String>) -> Result<Self, ScheduleError> {
        let zone_id = zone_id.into();
        parse_zone(&zone_id)?;
        self.zone_id = zone_id;
        Ok(self)
    }

    /// Occurrences in the half-open window `(from, upto]`, in ascending order.
    pub fn occurrences(
        &self,
        from: DateTime<Utc>,
        upto: DateTime<Utc>,
    ) -> Result<Occurrences, ScheduleError> {
        let source = match &self.schedule {
            Schedule::Cron { expression } => {
                let zone = parse_zone(&self.zone_id)?;
                Source::Cron {
                    schedule: parse_cron(expression)?,
                    zone,
                    wall_clock: from.with_timezone(&zone).naive_local(),
                    floor: from,
                }
            }
            Schedule::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err(ScheduleError::IntervalTooShort);
                }
                let period_ms = i64::try_from(*every_secs)
                    .unwrap_or(i64::MAX / 1000)
                    .saturating_mul(1000);
                let elapsed_ms = (from - self.created_at).num_milliseconds();
                let next_index = if elapsed_ms < 0 {
                    0
                } else {
                    elapsed_ms / period_ms + 1
                };
                Source::Interval {
                    anchor: self.created_at,
                    period_ms,
                    next_index,
                }
            }
        };
        Ok(Occurrences {
            source,
            upto,
            done: false,
        })
    }

    /// First occurrence strictly after `after`, if the schedule has one.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let upto = DateTime::<Utc>::MAX_UTC;
        self.occurrences(after, upto).ok()?.next()
    }

    /// Materialize the instance for one occurrence as a SCHEDULED job.
    pub fn to_scheduled_job(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        Job::scheduled(self.detail.clone(), at, now)
            .with_name(self.name.clone())
            .with_priority(self.priority)
            .with_recurring_job_id(self.id.clone())
    }
}

#[derive(Debug, Clone)]
enum Source {
    Cron {
        schedule: cron::Schedule,
        zone: Tz,
        /// Last wall-clock time evaluated, in the job's zone.
        wall_clock: NaiveDateTime,
        /// Occurrences must be strictly later than this.
        floor: DateTime<Utc>,
    },
    Interval {
        anchor: DateTime<Utc>,
        period_ms: i64,
        next_index: i64,
    },
}

/// Lazy iterator over the occurrences of a [`RecurringJob`] in a window.
///
/// Cloning restarts from the clone's position; two iterators over the same
/// definition and window yield the same sequence.
#[derive(Debug, Clone)]
pub struct Occurrences {
    source: Source,
    upto: DateTime<Utc>,
    done: bool,
}

impl Iterator for Occurrences {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match &mut self.source {
            Source::Cron {
                schedule,
                zone,
                wall_clock,
                floor,
            } => next_cron(schedule, zone, wall_clock, floor),
            Source::Interval {
                anchor,
                period_ms,
                next_index,
            } => {
                let offset = next_index.checked_mul(*period_ms);
                let next = offset.and_then(|ms| {
                    anchor.checked_add_signed(chrono::Duration::milliseconds(ms))
                });
                *next_index += 1;
                next
            }
        };
        match next {
            Some(t) if t <= self.upto => Some(t),
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Next cron occurrence after `wall_clock`, evaluated on the zone's wall
/// clock so daylight saving changes do not shift it.
///
/// A wall-clock time skipped by a forward change does not fire; one repeated
/// by a backward change fires once, at its first instance.
fn next_cron(
    schedule: &cron::Schedule,
    zone: &Tz,
    wall_clock: &mut NaiveDateTime,
    floor: &mut DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    loop {
        let candidate = schedule
            .after(&Utc.from_utc_datetime(wall_clock))
            .next()?
            .naive_utc();
        *wall_clock = candidate;
        let Some(at) = zone.from_local_datetime(&candidate).earliest() else {
            continue;
        };
        let at = at.with_timezone(&Utc);
        // Inside a repeated hour, the first pass may already lie behind us.
        if at > *floor {
            *floor = at;
            return Some(at);
        }
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn expansion_is_deterministic_and_ordered(
            every in 1u64..600,
            anchor in 0i64..10_000,
            from in 0i64..50_000,
            span in 0i64..20_000,
        ) {
            let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            let job = RecurringJob::new(
                JobDetail::handler("tick"),
                Schedule::every(Duration::from_secs(every)).unwrap(),
                base + chrono::Duration::seconds(anchor),
            ).unwrap();
            let from = base + chrono::Duration::seconds(from);
            let upto = from + chrono::Duration::seconds(span);

            let iter = job.occurrences(from, upto).unwrap();
            let first: Vec<_> = iter.clone().collect();
            let second: Vec<_> = iter.collect();

            prop_assert_eq!(&first, &second);
            prop_assert!(first.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(first.iter().all(|t| *t > from && *t <= upto));
        }
    }
}
