//! Job storage: the store contract every server process shares, plus an
//! in-memory implementation.
//!
//! ## Design
//!
//! - Optimistic concurrency only: no locks span processes
//! - `save` is batch-oriented and partial (conflicting jobs are reported, the
//!   rest are stored)
//! - Recurring definitions carry a checksum so servers reload them only on change

pub mod in_memory;
pub mod provider;

pub use in_memory::InMemoryStorageProvider;
pub use provider::{JobOrder, JobStats, Metadata, StorageError, StorageProvider};

#[cfg(test)]
pub(crate) mod testing;
