//! Start and stop task handlers.

use async_trait::async_trait;
use buildgate_core::{
    BuildExecutor, BuildId, BuildRequest, KeyValueStore, QueuedTask, Result, StopRequest, Task,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::keys::Keys;
use crate::middleware::Handler;
use crate::records::BuildConfigStore;

/// Hands builds to the executor and tears them down again.
pub struct BuildJobs {
    store: Arc<dyn KeyValueStore>,
    executor: Arc<dyn BuildExecutor>,
    records: BuildConfigStore,
    keys: Keys,
}

impl BuildJobs {
    pub fn new(store: Arc<dyn KeyValueStore>, executor: Arc<dyn BuildExecutor>, keys: Keys) -> Self {
        let records = BuildConfigStore::new(store.clone(), &keys);
        Self {
            store,
            executor,
            records,
            keys,
        }
    }

    /// Start an admitted build. A build without a config record was already
    /// resolved and is skipped.
    pub async fn start(&self, request: &BuildRequest) -> Result<()> {
        let Some(config) = self.records.get(request.build_id).await? else {
            warn!(build_id = %request.build_id, "No build config, not starting build");
            return Ok(());
        };

        self.executor.start(&config).await?;
        info!(build_id = %config.build_id, job_id = %config.job_id, executor = self.executor.name(), "Build started");
        Ok(())
    }

    /// Stop a build and release what it holds.
    pub async fn stop(&self, request: &BuildRequest) -> Result<()> {
        let build = request.build_id;
        let job = request.job_id;

        let annotations = match self.records.get(build).await {
            Ok(config) => config.map(|c| c.annotations),
            Err(e) => {
                warn!(build_id = %build, error = %e, "Could not read build config for stop");
                None
            }
        };
        self.records.delete(build).await?;

        let running_key = self.keys.running(job);
        let holder = self.store.get(&running_key).await?;
        if holder.as_deref().and_then(|v| v.parse::<BuildId>().ok()) == Some(build) {
            self.store.del(&running_key).await?;
        }
        self.store
            .lrem(&self.keys.waiting(job), 0, &build.to_string())
            .await?;

        self.executor
            .stop(&StopRequest {
                build_id: build,
                annotations,
            })
            .await?;
        info!(build_id = %build, job_id = %job, "Build stopped");
        Ok(())
    }
}

#[async_trait]
impl Handler for BuildJobs {
    async fn handle(&self, task: &QueuedTask) -> Result<()> {
        match task.task {
            Task::Start => self.start(&task.args).await,
            Task::Stop => self.stop(&task.args).await,
        }
    }
}
