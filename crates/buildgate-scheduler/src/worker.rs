//! Workers that process build tasks from the queue.

use buildgate_config::WorkerConfig;
use buildgate_core::{BuildExecutor, JobQueue, KeyValueStore, QueuedTask, StatusReporter, Task};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::BlockedBy;
use crate::jobs::BuildJobs;
use crate::keys::Keys;
use crate::middleware::{Outcome, Pipeline};
use crate::queue::TaskSource;
use crate::reaper::TimeoutReaper;
use crate::records::BuildConfigStore;
use crate::stages::{Admission, Filter, Retry};

/// Backoff after the queue itself failed.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Routes each task through the pipeline for its handler.
pub struct Dispatcher {
    start: Pipeline,
    stop: Pipeline,
}

impl Dispatcher {
    pub fn new(start: Pipeline, stop: Pipeline) -> Self {
        Self { start, stop }
    }

    /// `start`: filter, retry, admission. `stop`: retry only.
    pub fn from_config(
        config: &WorkerConfig,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<dyn JobQueue>,
        reporter: Arc<dyn StatusReporter>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Self {
        let keys = Keys::new(config.store.prefix.clone());
        let queue_name = keys.queue(&config.queue.name);

        let jobs = Arc::new(BuildJobs::new(store.clone(), executor, keys.clone()));
        let retry = Arc::new(Retry::new(
            queue.clone(),
            reporter.clone(),
            queue_name.clone(),
            config.retry.clone(),
        ));
        let filter = Arc::new(Filter::new(
            BuildConfigStore::new(store.clone(), &keys),
            queue.clone(),
            queue_name.clone(),
            config.worker.cluster.clone(),
        ));
        let gate = Arc::new(BlockedBy::new(
            store,
            queue,
            reporter,
            keys,
            queue_name,
            config.blocked_by.clone(),
        ));

        let start = Pipeline::new(jobs.clone())
            .stage(filter)
            .stage(retry.clone())
            .stage(Arc::new(Admission::new(gate)));
        let stop = Pipeline::new(jobs).stage(retry);
        Self::new(start, stop)
    }

    pub async fn dispatch(&self, task: &QueuedTask) -> Outcome {
        match task.task {
            Task::Start => self.start.run(task).await,
            Task::Stop => self.stop.run(task).await,
        }
    }
}

/// A worker that claims and dispatches tasks.
pub struct Worker {
    id: String,
    queue_name: String,
    source: Arc<dyn TaskSource>,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue_name: impl Into<String>,
        source: Arc<dyn TaskSource>,
        dispatcher: Arc<Dispatcher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            source,
            dispatcher,
            poll_interval,
        }
    }

    /// Run the worker loop until `shutdown` flips to true. A task already
    /// claimed is always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, queue = %self.queue_name, "Starting worker");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            match self.source.claim(&self.queue_name).await {
                Ok(Some(task)) => {
                    info!(worker_id = %self.id, build_id = %task.args.build_id, task = %task.task, "Claimed task");
                    match self.dispatcher.dispatch(&task).await {
                        Outcome::Completed | Outcome::Denied { .. } => {}
                        Outcome::Failed { error, retried } => {
                            warn!(worker_id = %self.id, build_id = %task.args.build_id, error = %error, retried, "Task failed");
                        }
                    }
                }
                Ok(None) => {
                    if idle(&mut shutdown, self.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim task");
                    if idle(&mut shutdown, CLAIM_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}

/// Sleep for `period` unless shutdown comes first. Returns true on shutdown.
async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Worker slots plus the timeout reaper, sharing one store and queue.
pub struct WorkerPool {
    workers: Vec<Worker>,
    reaper: TimeoutReaper,
}

impl WorkerPool {
    pub fn new<Q>(
        config: &WorkerConfig,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<Q>,
        reporter: Arc<dyn StatusReporter>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Self
    where
        Q: JobQueue + TaskSource + 'static,
    {
        let keys = Keys::new(config.store.prefix.clone());
        let queue_name = keys.queue(&config.queue.name);
        let dispatcher = Arc::new(Dispatcher::from_config(
            config,
            store.clone(),
            queue.clone(),
            reporter.clone(),
            executor,
        ));

        let workers = (0..config.worker.processors.max(1))
            .map(|_| {
                Worker::new(
                    format!("worker-{}", Uuid::now_v7()),
                    queue_name.clone(),
                    queue.clone(),
                    dispatcher.clone(),
                    config.worker.poll_interval,
                )
            })
            .collect();
        let reaper = TimeoutReaper::new(store, reporter, keys, config.timeout.clone());

        Self { workers, reaper }
    }

    /// Run every worker and the reaper until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers.len(), "Starting worker pool");

        let mut handles = Vec::with_capacity(self.workers.len() + 1);
        for worker in self.workers {
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        let reaper = self.reaper;
        handles.push(tokio::spawn(async move { reaper.run(shutdown).await }));

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::testing::{RecordingExecutor, RecordingReporter};
    use buildgate_core::{BuildConfig, BuildId, BuildRequest, BuildStatus};
    use buildgate_store::MemoryStore;
    use std::future::Future;

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.worker.processors = 2;
        config.worker.poll_interval = Duration::from_millis(10);
        config.blocked_by.reenqueue_wait_time = Duration::from_millis(20);
        config.retry.delay = Duration::from_millis(10);
        config
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        reporter: Arc<RecordingReporter>,
        executor: Arc<RecordingExecutor>,
        records: BuildConfigStore,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        Fixture {
            records: BuildConfigStore::new(store.clone(), &Keys::default()),
            store,
            queue: Arc::new(MemoryQueue::new()),
            reporter: Arc::new(RecordingReporter::new()),
            executor: Arc::new(RecordingExecutor::new()),
        }
    }

    impl Fixture {
        fn dispatcher(&self, config: &WorkerConfig) -> Dispatcher {
            Dispatcher::from_config(
                config,
                self.store.clone(),
                self.queue.clone(),
                self.reporter.clone(),
                self.executor.clone(),
            )
        }

        fn pool(&self, config: &WorkerConfig) -> WorkerPool {
            WorkerPool::new(
                config,
                self.store.clone(),
                self.queue.clone(),
                self.reporter.clone(),
                self.executor.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_dispatch_starts_admitted_build() {
        let f = fixture();
        f.records.put(&BuildConfig::new(5u64, 1u64)).await.unwrap();
        let dispatcher = f.dispatcher(&config());

        let outcome = dispatcher
            .dispatch(&QueuedTask::start(BuildRequest::new(5u64, 1u64)))
            .await;

        assert!(matches!(outcome, Outcome::Completed));
        assert_eq!(f.executor.started(), vec![BuildId::new(5)]);
        assert_eq!(f.store.get("running_job_1").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_dispatch_denies_blocked_build() {
        let f = fixture();
        f.records.put(&BuildConfig::new(5u64, 1u64)).await.unwrap();
        f.store.set("running_job_2", "9").await.unwrap();
        let dispatcher = f.dispatcher(&config());

        let outcome = dispatcher
            .dispatch(&QueuedTask::start(BuildRequest::new(5u64, 1u64).blocked_by([2u64])))
            .await;

        assert!(matches!(outcome, Outcome::Denied { stage: "blocked_by" }));
        assert!(f.executor.started().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_is_retried_then_readmitted() {
        let f = fixture();
        f.records.put(&BuildConfig::new(5u64, 1u64)).await.unwrap();
        let dispatcher = f.dispatcher(&config());
        let task = QueuedTask::start(BuildRequest::new(5u64, 1u64));

        f.executor.set_failing(true);
        let outcome = dispatcher.dispatch(&task).await;
        assert!(matches!(outcome, Outcome::Failed { retried: true, .. }));

        // The retry finds the build already holding its lock.
        f.executor.set_failing(false);
        let retried = f.queue.scheduled().await[0].task.clone();
        assert!(matches!(dispatcher.dispatch(&retried).await, Outcome::Completed));
        assert_eq!(f.executor.started(), vec![BuildId::new(5)]);
    }

    #[tokio::test]
    async fn test_stop_bypasses_admission() {
        let f = fixture();
        f.store.set("running_job_1", "5").await.unwrap();
        f.store.set("deleted_1_5", "").await.unwrap();
        let dispatcher = f.dispatcher(&config());

        let outcome = dispatcher
            .dispatch(&QueuedTask::stop(BuildRequest::new(5u64, 1u64)))
            .await;

        assert!(matches!(outcome, Outcome::Completed));
        assert_eq!(f.executor.stopped().len(), 1);
        assert!(!f.store.exists("running_job_1").await);
    }

    #[tokio::test]
    async fn test_pool_runs_blocked_build_once_unblocked() {
        let f = fixture();
        let config = config();
        f.records.put(&BuildConfig::new(5u64, 1u64)).await.unwrap();
        f.store.set("running_job_2", "9").await.unwrap();
        f.queue
            .enqueue(
                "builds",
                QueuedTask::start(BuildRequest::new(5u64, 1u64).blocked_by([2u64])),
            )
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let pool = tokio::spawn(f.pool(&config).run(rx));

        let fx = &f;
        eventually(move || async move {
            fx.reporter.statuses_for(5).contains(&BuildStatus::Blocked)
        })
        .await;
        assert!(f.executor.started().is_empty());

        f.store.del("running_job_2").await.unwrap();
        eventually(move || async move { !fx.executor.started().is_empty() }).await;
        assert_eq!(f.executor.started(), vec![BuildId::new(5)]);
        assert!(!f.store.exists("waiting_job_1").await);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool)
            .await
            .unwrap()
            .unwrap();
    }
}
