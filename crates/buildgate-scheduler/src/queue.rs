//! In-memory job queue.
//!
//! Stands in for the external queue runtime in tests and single-process
//! deployments: ready tasks per queue, plus a delayed lane that is promoted
//! onto the ready lane once due.

use async_trait::async_trait;
use buildgate_core::{JobQueue, QueuedTask, Result};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Source workers claim tasks from.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Take the next ready task from `queue`, if any.
    async fn claim(&self, queue: &str) -> Result<Option<QueuedTask>>;
}

/// A task waiting in the delayed lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub queue: String,
    pub task: QueuedTask,
    /// Delay requested when the task was scheduled.
    pub delay: Duration,
    due: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: HashMap<String, VecDeque<QueuedTask>>,
    delayed: Vec<ScheduledTask>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) -> usize {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|s| s.due <= now);
        self.delayed = pending;
        let promoted = due.len();
        for scheduled in due {
            self.ready
                .entry(scheduled.queue)
                .or_default()
                .push_back(scheduled.task);
        }
        promoted
    }
}

/// Job queue held in process memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move every due delayed task onto its ready lane.
    pub async fn promote_due(&self) -> usize {
        self.state.lock().await.promote_due(Instant::now())
    }

    /// Number of ready tasks on `queue`.
    pub async fn ready_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.ready.get(queue).map_or(0, VecDeque::len)
    }

    /// Snapshot of the delayed lane, in scheduling order.
    pub async fn scheduled(&self) -> Vec<ScheduledTask> {
        self.state.lock().await.delayed.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, task: QueuedTask) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(task);
        Ok(())
    }

    async fn enqueue_in(&self, delay: Duration, queue: &str, task: QueuedTask) -> Result<()> {
        let mut state = self.state.lock().await;
        state.delayed.push(ScheduledTask {
            queue: queue.to_string(),
            task,
            delay,
            due: Instant::now() + delay,
        });
        Ok(())
    }
}

#[async_trait]
impl TaskSource for MemoryQueue {
    async fn claim(&self, queue: &str) -> Result<Option<QueuedTask>> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());
        Ok(state.ready.get_mut(queue).and_then(VecDeque::pop_front))
    }
}
