//! Job queue runtime interface.
//!
//! The queue runtime owns durability, acknowledgement and worker scaling.
//! The gate only needs to put work back on a queue, possibly after a delay.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BuildRequest, Result};

/// Handler a queued task is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[display("start")]
    Start,
    #[display("stop")]
    Stop,
}

/// One delivery of a task with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    pub args: BuildRequest,
    /// Number of failed attempts that preceded this delivery.
    #[serde(default)]
    pub attempt: u32,
}

impl QueuedTask {
    pub fn start(args: BuildRequest) -> Self {
        Self {
            task: Task::Start,
            args,
            attempt: 0,
        }
    }

    pub fn stop(args: BuildRequest) -> Self {
        Self {
            task: Task::Stop,
            args,
            attempt: 0,
        }
    }

    /// The same delivery, counted as one more failed attempt.
    pub fn retried(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make `task` available on `queue` immediately.
    async fn enqueue(&self, queue: &str, task: QueuedTask) -> Result<()>;

    /// Make `task` available on `queue` once `delay` has elapsed.
    async fn enqueue_in(&self, delay: Duration, queue: &str, task: QueuedTask) -> Result<()>;
}
