//! `jobweave-core`: job model building blocks.
//!
//! This crate contains the **pure** job model (no I/O): identifiers, the state
//! lifecycle, the versioned job entity, recurring schedules and the clock
//! abstraction every time-dependent operation reads from.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod recurring;
pub mod state;
pub mod versioning;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobResult, JobStateError, ScheduleError};
pub use id::{JobId, ServerId};
pub use job::{Job, JobDetail};
pub use recurring::{Occurrences, RecurringJob, Schedule};
pub use state::{JobState, StateName};
pub use versioning::JobVersioner;
