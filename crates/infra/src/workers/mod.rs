//! Bounded execution of claimed jobs.
//!
//! ## Components
//!
//! - `HandlerRegistry`: name → handler lookup with `prefix.*` and `*` fallbacks
//! - `WorkerDirectory`: jobs running on this process, with their cancellation tokens
//! - `WorkerPool`: semaphore-bounded task pool that runs handlers and records outcomes

pub mod directory;
pub mod pool;
pub mod registry;

pub use directory::{DirectoryLease, InFlightJob, WorkerDirectory};
pub use pool::{DispatchError, WorkerPool, WorkerStats};
pub use registry::{HandlerRegistry, JobContext, JobHandler, PermanentFailure};
