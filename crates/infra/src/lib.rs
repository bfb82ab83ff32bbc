//! Infrastructure layer: storage contract, conflict resolution, workers and
//! the background job server.

pub mod conflict;
pub mod filters;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod workers;

pub use scheduler::{JobScheduler, SchedulerError};
pub use server::{BackgroundJobServer, BackgroundJobServerConfig, ServerError};
