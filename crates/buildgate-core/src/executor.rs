//! Executor interface.
//!
//! Executors own the runtime of a build (containers, pods, VMs). The gate
//! only tells them when to start and stop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Annotations, BuildConfig, BuildId, Result};

/// What an executor needs to tear a build down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub build_id: BuildId,
    /// Present when the build config record could still be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// Trait for build executors.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &str;

    /// Start the runtime for a build. Returns once the build has been
    /// handed off, not when it finishes.
    async fn start(&self, config: &BuildConfig) -> Result<()>;

    /// Stop a build's runtime.
    async fn stop(&self, request: &StopRequest) -> Result<()>;
}
