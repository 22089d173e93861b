//! Core domain types and traits for the build admission gate.
//!
//! This crate contains:
//! - Build and job identifiers
//! - Build configuration records, annotations and lifecycle statuses
//! - Queue task envelopes
//! - Collaborator traits (key-value store, status reporter, job queue, executor)

pub mod build;
pub mod error;
pub mod executor;
pub mod id;
pub mod queue;
pub mod reporter;
pub mod store;

pub use build::{Annotations, BuildConfig, BuildRequest, BuildStatus};
pub use error::{Error, Result};
pub use executor::{BuildExecutor, StopRequest};
pub use id::{BuildId, JobId};
pub use queue::{JobQueue, QueuedTask, Task};
pub use reporter::StatusReporter;
pub use store::KeyValueStore;
