//! Build status reporting.

use async_trait::async_trait;

use crate::{BuildId, BuildStatus, Result};

/// Persists a build's lifecycle status with a human-readable message.
///
/// Callers treat reporting as best-effort: an `Err` is logged by the caller
/// and never changes the outcome of the operation that triggered it.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, build_id: BuildId, status: BuildStatus, message: &str) -> Result<()>;

    /// End the build's active step, if any, with exit `code`. Returns the
    /// name of the step that was ended.
    async fn stop_active_step(&self, _build_id: BuildId, _code: i32) -> Result<Option<String>> {
        Ok(None)
    }
}
