//! Build admission and dispatch.
//!
//! Decides when queued builds may start ([`BlockedBy`]), fails builds that
//! outlive their timeout ([`TimeoutReaper`]), and runs the workers that move
//! tasks from the queue through the middleware pipeline to the executor.

pub mod admission;
pub mod jobs;
pub mod keys;
pub mod middleware;
pub mod queue;
pub mod reaper;
pub mod records;
pub mod reporter;
pub mod stages;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{BlockedBy, Verdict};
pub use jobs::BuildJobs;
pub use keys::Keys;
pub use middleware::{Flow, Handler, Middleware, Outcome, Pipeline};
pub use queue::{MemoryQueue, ScheduledTask, TaskSource};
pub use reaper::{SweepSummary, TimeoutReaper};
pub use records::BuildConfigStore;
pub use reporter::ApiStatusReporter;
pub use stages::{Admission, Filter, Retry};
pub use worker::{Dispatcher, Worker, WorkerPool};
