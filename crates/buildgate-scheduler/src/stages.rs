//! Pipeline stages for build tasks.

use async_trait::async_trait;
use buildgate_config::RetryConfig;
use buildgate_core::{BuildStatus, Error, JobQueue, QueuedTask, Result, StatusReporter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::admission::BlockedBy;
use crate::middleware::{Flow, Middleware};
use crate::records::BuildConfigStore;

/// How long a build routed to another cluster waits before redelivery.
const FILTER_REENQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Routes builds to the worker pool of their cluster.
///
/// Builds without a cluster name, and pools without a cluster label, accept
/// everything.
pub struct Filter {
    records: BuildConfigStore,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    cluster: Option<String>,
}

impl Filter {
    pub fn new(
        records: BuildConfigStore,
        queue: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
        cluster: Option<String>,
    ) -> Self {
        Self {
            records,
            queue,
            queue_name: queue_name.into(),
            cluster,
        }
    }

    async fn pass_on(&self, task: &QueuedTask) -> Flow {
        if let Err(e) = self
            .queue
            .enqueue_in(FILTER_REENQUEUE_DELAY, &self.queue_name, task.clone())
            .await
        {
            error!(build_id = %task.args.build_id, error = %e, "Failed to pass build on to its cluster");
        }
        Flow::Deny
    }
}

#[async_trait]
impl Middleware for Filter {
    fn name(&self) -> &'static str {
        "filter"
    }

    async fn before(&self, task: &QueuedTask) -> Result<Flow> {
        let Some(cluster) = &self.cluster else {
            return Ok(Flow::Proceed);
        };

        let config = match self.records.get(task.args.build_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(build_id = %task.args.build_id, error = %e, "Could not read build config for routing");
                return Ok(self.pass_on(task).await);
            }
        };

        match config.and_then(|c| c.build_cluster_name) {
            Some(wanted) if &wanted != cluster => {
                info!(build_id = %task.args.build_id, %wanted, %cluster, "Build belongs to another cluster");
                Ok(self.pass_on(task).await)
            }
            _ => Ok(Flow::Proceed),
        }
    }
}

/// Re-enqueues tasks whose handler failed, up to a limit.
pub struct Retry {
    queue: Arc<dyn JobQueue>,
    reporter: Arc<dyn StatusReporter>,
    queue_name: String,
    options: RetryConfig,
}

impl Retry {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        reporter: Arc<dyn StatusReporter>,
        queue_name: impl Into<String>,
        options: RetryConfig,
    ) -> Self {
        Self {
            queue,
            reporter,
            queue_name: queue_name.into(),
            options,
        }
    }
}

#[async_trait]
impl Middleware for Retry {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn before(&self, _task: &QueuedTask) -> Result<Flow> {
        Ok(Flow::Proceed)
    }

    async fn on_failure(&self, task: &QueuedTask, error: &Error) -> bool {
        let build = task.args.build_id;

        if task.attempt + 1 < self.options.limit {
            let next = task.retried();
            match self
                .queue
                .enqueue_in(self.options.delay, &self.queue_name, next)
                .await
            {
                Ok(()) => {
                    warn!(build_id = %build, task = %task.task, attempt = task.attempt + 1, error = %error, "Task failed, retrying");
                    return true;
                }
                Err(e) => error!(build_id = %build, error = %e, "Failed to re-enqueue task"),
            }
        }

        error!(build_id = %build, task = %task.task, error = %error, "Task failed, giving up");
        if let Err(e) = self
            .reporter
            .report(build, BuildStatus::Failure, &error.to_string())
            .await
        {
            warn!(build_id = %build, error = %e, "Failed to report task failure");
        }
        false
    }
}

/// Runs the admission gate before a build starts.
pub struct Admission {
    gate: Arc<BlockedBy>,
}

impl Admission {
    pub fn new(gate: Arc<BlockedBy>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Middleware for Admission {
    fn name(&self) -> &'static str {
        "blocked_by"
    }

    async fn before(&self, task: &QueuedTask) -> Result<Flow> {
        match self.gate.pre_admit(&task.args).await {
            Ok(verdict) if verdict.proceed() => Ok(Flow::Proceed),
            Ok(verdict) => {
                info!(build_id = %task.args.build_id, ?verdict, "Build not admitted");
                Ok(Flow::Deny)
            }
            Err(e) => {
                // The decision failed part way; try the whole thing again later.
                error!(build_id = %task.args.build_id, error = %e, "Admission check failed");
                if let Err(e) = self.gate.retry_later(&task.args).await {
                    error!(build_id = %task.args.build_id, error = %e, "Failed to re-enqueue build");
                }
                Ok(Flow::Deny)
            }
        }
    }

    async fn after(&self, task: &QueuedTask) -> Result<()> {
        self.gate.post_admit(&task.args).await?;
        Ok(())
    }
}
