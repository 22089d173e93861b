//! Admission gate for queued builds.
//!
//! Before a build may start it must pass [`BlockedBy::pre_admit`], which
//! enforces, using only single-key operations on the shared store:
//! - cross-job blocking: a build waits while any job it is blocked by has a
//!   running build,
//! - self-serialization: builds of one job run one at a time, lowest build
//!   id first,
//! - collapsing: the newest waiting build of a job supersedes older ones,
//! - cancellation: a delete marker aborts the build at its next attempt.
//!
//! A denied build is pushed onto its job's waiting queue and delivered again
//! after `reenqueue_wait_time`.
//!
//! Workers run this concurrently with no lock around a whole decision. The
//! waiting queue reads are check-then-act and can interleave with other
//! workers; ordering only holds through the numeric build id comparison.
//! The final admit step for self-serialized jobs is a single set-if-absent,
//! so two builds of such a job can not both take the running lock.

use buildgate_config::BlockedByConfig;
use buildgate_core::{
    BuildId, BuildRequest, BuildStatus, JobId, JobQueue, KeyValueStore, QueuedTask, Result,
    StatusReporter,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::keys::Keys;
use crate::records::BuildConfigStore;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The build took its job's running lock.
    Admitted,
    /// The build already held the running lock from an earlier attempt.
    Readmitted,
    /// Another job's build (or this job's, under self-serialization) is
    /// running. The build was rescheduled.
    Blocked { blockers: Vec<BuildId> },
    /// An earlier build of the same job is still waiting. The build was
    /// rescheduled.
    Queued { ahead: BuildId },
    /// The build superseded older waiting builds and was rescheduled.
    Collapsed { superseded: Vec<BuildId> },
    /// A newer build of the same job is already waiting; this one is dropped.
    Superseded { by: BuildId },
    /// The build was cancelled before it ran.
    Aborted,
}

impl Verdict {
    /// Whether the caller may start the build.
    pub fn proceed(&self) -> bool {
        matches!(self, Verdict::Admitted | Verdict::Readmitted)
    }
}

/// Admission coordinator.
pub struct BlockedBy {
    store: Arc<dyn KeyValueStore>,
    queue: Arc<dyn JobQueue>,
    reporter: Arc<dyn StatusReporter>,
    records: BuildConfigStore,
    keys: Keys,
    queue_name: String,
    options: BlockedByConfig,
}

impl BlockedBy {
    /// `queue_name` is the fully qualified queue denied builds are sent back to.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queue: Arc<dyn JobQueue>,
        reporter: Arc<dyn StatusReporter>,
        keys: Keys,
        queue_name: impl Into<String>,
        options: BlockedByConfig,
    ) -> Self {
        let records = BuildConfigStore::new(store.clone(), &keys);
        Self {
            store,
            queue,
            reporter,
            records,
            keys,
            queue_name: queue_name.into(),
            options,
        }
    }

    pub fn options(&self) -> &BlockedByConfig {
        &self.options
    }

    /// Decide whether `request` may start now.
    pub async fn pre_admit(&self, request: &BuildRequest) -> Result<Verdict> {
        let job = request.job_id;
        let build = request.build_id;
        let running_key = self.keys.running(job);
        let delete_key = self.keys.deleted(job, build);

        let blocking_jobs = self.blocking_jobs(request);
        let blocking_keys: Vec<String> = blocking_jobs.iter().map(|j| self.keys.running(*j)).collect();

        let (delete_marker, running, blocking_values) = tokio::try_join!(
            self.store.get(&delete_key),
            self.store.get(&running_key),
            self.store.mget(&blocking_keys),
        )?;

        // Re-entry after a failure past the gate, e.g. the executor failed to
        // start and the task was retried. Must not queue behind itself.
        if parse_lock(running.as_deref()) == Some(build) {
            debug!(build_id = %build, job_id = %job, "Build already holds the running lock");
            return Ok(Verdict::Readmitted);
        }

        if delete_marker.is_some() {
            self.abort(request).await?;
            return Ok(Verdict::Aborted);
        }

        let mut blocked = false;
        let mut blockers: Vec<BuildId> = Vec::new();
        for (blocking_job, value) in blocking_jobs.iter().zip(blocking_values) {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            blocked = true;
            match value.parse() {
                Ok(id) => blockers.push(id),
                Err(_) => warn!(job_id = %blocking_job, %value, "Unparseable running lock value"),
            }
        }

        if blocked {
            if self.options.blocked_by_self && self.collapse_enabled(build).await {
                return self.collapse(request, &blockers).await;
            }
            self.reschedule(request, BuildStatus::Blocked, blocked_message(&blockers))
                .await?;
            return Ok(Verdict::Blocked { blockers });
        }

        if self.options.blocked_by_self {
            if let Some(ahead) = self.check_self_block(request).await? {
                return Ok(Verdict::Queued { ahead });
            }
        } else {
            // No serialization for this job, so nothing should be waiting.
            self.store.del(&self.keys.waiting(job)).await?;
        }

        self.admit(request).await
    }

    /// Runs after the build has been handed to the executor.
    ///
    /// The running lock stays held, since the build is still running at this
    /// point. It is released by the stop task, by its TTL, or by the timeout
    /// reaper.
    pub async fn post_admit(&self, request: &BuildRequest) -> Result<bool> {
        debug!(build_id = %request.build_id, job_id = %request.job_id, "Build handed off");
        Ok(true)
    }

    /// Send `request` back to the queue without touching any coordination
    /// state. Used when an admission attempt failed part way.
    pub async fn retry_later(&self, request: &BuildRequest) -> Result<()> {
        self.queue
            .enqueue_in(
                self.options.reenqueue_wait_time,
                &self.queue_name,
                QueuedTask::start(request.clone()),
            )
            .await
    }

    fn blocking_jobs(&self, request: &BuildRequest) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = Vec::with_capacity(request.blocked_by.len() + 1);
        for job in &request.blocked_by {
            if *job == request.job_id && !self.options.blocked_by_self {
                continue;
            }
            if !jobs.contains(job) {
                jobs.push(*job);
            }
        }
        if self.options.blocked_by_self && !jobs.contains(&request.job_id) {
            jobs.push(request.job_id);
        }
        jobs
    }

    /// The build's own annotation wins over the configured policy.
    async fn collapse_enabled(&self, build: BuildId) -> bool {
        match self.records.get(build).await {
            Ok(Some(config)) => config
                .annotations
                .collapse()
                .unwrap_or(self.options.collapse),
            Ok(None) => self.options.collapse,
            Err(e) => {
                warn!(build_id = %build, error = %e, "Could not read build annotations");
                self.options.collapse
            }
        }
    }

    async fn abort(&self, request: &BuildRequest) -> Result<()> {
        let job = request.job_id;
        let build = request.build_id;
        let running_key = self.keys.running(job);

        self.store.del(&self.keys.deleted(job, build)).await?;
        self.store
            .lrem(&self.keys.waiting(job), 0, &build.to_string())
            .await?;
        if parse_lock(self.store.get(&running_key).await?.as_deref()) == Some(build) {
            self.store.del(&running_key).await?;
        }

        info!(build_id = %build, job_id = %job, "Build was cancelled, dropping it");
        Ok(())
    }

    async fn admit(&self, request: &BuildRequest) -> Result<Verdict> {
        let job = request.job_id;
        let build = request.build_id;
        let running_key = self.keys.running(job);
        let ttl = self.options.block_timeout;

        if !self.options.blocked_by_self {
            self.store
                .set_with_ttl(&running_key, &build.to_string(), ttl)
                .await?;
            info!(build_id = %build, job_id = %job, "Build admitted");
            return Ok(Verdict::Admitted);
        }

        if self
            .store
            .set_if_absent(&running_key, &build.to_string(), ttl)
            .await?
        {
            info!(build_id = %build, job_id = %job, "Build admitted");
            return Ok(Verdict::Admitted);
        }

        // Lost the race for the lock to another worker.
        match parse_lock(self.store.get(&running_key).await?.as_deref()) {
            Some(holder) if holder == build => Ok(Verdict::Readmitted),
            holder => {
                let blockers: Vec<BuildId> = holder.into_iter().collect();
                self.reschedule(request, BuildStatus::Blocked, blocked_message(&blockers))
                    .await?;
                Ok(Verdict::Blocked { blockers })
            }
        }
    }

    /// Supersede older waiting builds of this job with `request`.
    async fn collapse(&self, request: &BuildRequest, blockers: &[BuildId]) -> Result<Verdict> {
        let job = request.job_id;
        let build = request.build_id;
        let waiting_key = self.keys.waiting(job);
        let waiting = self.waiting_builds(job).await?;

        if let Some(&newest) = waiting.last() {
            if build < newest {
                self.store.lrem(&waiting_key, 0, &build.to_string()).await?;
                self.mark_collapsed(job, build, newest).await;
                info!(build_id = %build, job_id = %job, by = %newest, "Build superseded by a newer waiting build");
                return Ok(Verdict::Superseded { by: newest });
            }
        }

        let superseded: Vec<BuildId> = waiting.into_iter().filter(|b| *b != build).collect();
        for old in &superseded {
            self.store.lrem(&waiting_key, 0, &old.to_string()).await?;
            self.mark_collapsed(job, *old, build).await;
        }
        if !superseded.is_empty() {
            info!(build_id = %build, job_id = %job, ?superseded, "Collapsed waiting builds");
        }

        self.reschedule(request, BuildStatus::Blocked, blocked_message(blockers))
            .await?;
        Ok(Verdict::Collapsed { superseded })
    }

    /// Report `old` as collapsed into `by` and cancel its pending delivery.
    ///
    /// Collapsing resolves `old`, so its config record goes too. The status
    /// report reads that record and must come first.
    async fn mark_collapsed(&self, job: JobId, old: BuildId, by: BuildId) {
        let message = format!("Collapsed to build: {}", by);
        self.report(old, BuildStatus::Collapsed, &message).await;

        if let Err(e) = self.records.delete(old).await {
            warn!(build_id = %old, error = %e, "Failed to remove collapsed build config");
        }

        let marker = self.keys.deleted(job, old);
        if let Err(e) = self
            .store
            .set_with_ttl(&marker, &by.to_string(), self.options.block_timeout)
            .await
        {
            warn!(build_id = %old, error = %e, "Failed to mark collapsed build as deleted");
        }
    }

    /// Returns the build this one must wait for, if any.
    async fn check_self_block(&self, request: &BuildRequest) -> Result<Option<BuildId>> {
        let job = request.job_id;
        let build = request.build_id;
        let waiting = self.waiting_builds(job).await?;

        let Some(&first) = waiting.first() else {
            return Ok(None);
        };

        if first != build {
            let message = format!("Waiting for build {} of the same job to start", first);
            self.reschedule(request, BuildStatus::Queued, message).await?;
            return Ok(Some(first));
        }

        // Head of the line. An emptied list disappears on its own; deleting
        // the key here could drop a concurrent push.
        self.store
            .lrem(&self.keys.waiting(job), 0, &build.to_string())
            .await?;
        Ok(None)
    }

    /// Queue `request` for another attempt and tell the build API why.
    async fn reschedule(
        &self,
        request: &BuildRequest,
        status: BuildStatus,
        message: String,
    ) -> Result<()> {
        let build = request.build_id;
        let waiting_key = self.keys.waiting(request.job_id);
        let build_str = build.to_string();

        let waiting = self.store.lrange(&waiting_key, 0, -1).await?;
        if !waiting.contains(&build_str) {
            self.store.rpush(&waiting_key, &build_str).await?;
        }

        self.retry_later(request).await?;
        debug!(build_id = %build, job_id = %request.job_id, %status, "Build rescheduled");

        self.report(build, status, &message).await;
        Ok(())
    }

    async fn report(&self, build: BuildId, status: BuildStatus, message: &str) {
        if let Err(e) = self.reporter.report(build, status, message).await {
            warn!(build_id = %build, %status, error = %e, "Failed to update build status");
        }
    }

    /// Waiting build ids of `job`, ascending and deduplicated.
    async fn waiting_builds(&self, job: JobId) -> Result<Vec<BuildId>> {
        let raw = self.store.lrange(&self.keys.waiting(job), 0, -1).await?;
        let mut builds: Vec<BuildId> = raw
            .iter()
            .filter_map(|v| match v.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(job_id = %job, value = %v, "Skipping unparseable waiting entry");
                    None
                }
            })
            .collect();
        builds.sort_unstable();
        builds.dedup();
        Ok(builds)
    }
}

fn parse_lock(value: Option<&str>) -> Option<BuildId> {
    value.and_then(|v| v.parse().ok())
}

fn blocked_message(blockers: &[BuildId]) -> String {
    let ids: Vec<String> = blockers.iter().map(ToString::to_string).collect();
    format!("Blocked by these running build(s): {}", ids.join(", "))
}
