//! Middleware pipeline around task handlers.
//!
//! Stages run `before` in order; any stage may deny the task, which ends it
//! without running the handler. After the handler succeeds, `after` hooks
//! run in reverse order. When the handler fails, every stage that was
//! entered gets a chance to take the failure over (typically by re-enqueueing
//! the task).

use async_trait::async_trait;
use buildgate_core::{Error, QueuedTask, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether a task continues past a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Deny,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, task: &QueuedTask) -> Result<Flow>;

    async fn after(&self, _task: &QueuedTask) -> Result<()> {
        Ok(())
    }

    /// Returns true when the stage has taken care of the failed task.
    async fn on_failure(&self, _task: &QueuedTask, _error: &Error) -> bool {
        false
    }
}

/// The work at the end of a pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, task: &QueuedTask) -> Result<()>;
}

/// How a task left the pipeline.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Denied { stage: &'static str },
    Failed { error: Error, retried: bool },
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            stages: Vec::new(),
            handler,
        }
    }

    /// Append a stage; stages run in the order they are added.
    pub fn stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, task: &QueuedTask) -> Outcome {
        for (entered, stage) in self.stages.iter().enumerate() {
            match stage.before(task).await {
                Ok(Flow::Proceed) => {}
                Ok(Flow::Deny) => {
                    debug!(stage = stage.name(), build_id = %task.args.build_id, "Task denied");
                    return Outcome::Denied {
                        stage: stage.name(),
                    };
                }
                Err(error) => return self.fail(&self.stages[..=entered], task, error).await,
            }
        }

        if let Err(error) = self.handler.handle(task).await {
            return self.fail(&self.stages, task, error).await;
        }

        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.after(task).await {
                warn!(stage = stage.name(), build_id = %task.args.build_id, error = %e, "After hook failed");
            }
        }
        Outcome::Completed
    }

    async fn fail(&self, entered: &[Arc<dyn Middleware>], task: &QueuedTask, error: Error) -> Outcome {
        let mut retried = false;
        for stage in entered {
            retried |= stage.on_failure(task, &error).await;
        }
        Outcome::Failed { error, retried }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgate_core::BuildRequest;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Trace(Mutex<Vec<String>>);

    impl Trace {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Stage {
        name: &'static str,
        flow: Flow,
        handles_failure: bool,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl Middleware for Stage {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn before(&self, _task: &QueuedTask) -> Result<Flow> {
            self.trace.push(format!("before {}", self.name));
            Ok(self.flow)
        }

        async fn after(&self, _task: &QueuedTask) -> Result<()> {
            self.trace.push(format!("after {}", self.name));
            Ok(())
        }

        async fn on_failure(&self, _task: &QueuedTask, _error: &Error) -> bool {
            self.trace.push(format!("failure {}", self.name));
            self.handles_failure
        }
    }

    struct Work {
        fail: bool,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl Handler for Work {
        async fn handle(&self, _task: &QueuedTask) -> Result<()> {
            self.trace.push("handle");
            if self.fail {
                return Err(Error::Executor("boom".to_string()));
            }
            Ok(())
        }
    }

    fn stage(name: &'static str, flow: Flow, trace: &Arc<Trace>) -> Arc<dyn Middleware> {
        Arc::new(Stage {
            name,
            flow,
            handles_failure: name == "retry",
            trace: trace.clone(),
        })
    }

    fn pipeline(fail: bool, second: Flow, trace: &Arc<Trace>) -> Pipeline {
        Pipeline::new(Arc::new(Work {
            fail,
            trace: trace.clone(),
        }))
        .stage(stage("retry", Flow::Proceed, trace))
        .stage(stage("gate", second, trace))
    }

    fn task() -> QueuedTask {
        QueuedTask::start(BuildRequest::new(1u64, 2u64))
    }

    #[tokio::test]
    async fn test_runs_after_hooks_in_reverse() {
        let trace = Arc::new(Trace::default());
        let outcome = pipeline(false, Flow::Proceed, &trace).run(&task()).await;

        assert!(matches!(outcome, Outcome::Completed));
        assert_eq!(
            trace.events(),
            vec!["before retry", "before gate", "handle", "after gate", "after retry"]
        );
    }

    #[tokio::test]
    async fn test_denied_task_skips_handler() {
        let trace = Arc::new(Trace::default());
        let outcome = pipeline(false, Flow::Deny, &trace).run(&task()).await;

        assert!(matches!(outcome, Outcome::Denied { stage: "gate" }));
        assert_eq!(trace.events(), vec!["before retry", "before gate"]);
    }

    #[tokio::test]
    async fn test_failure_is_offered_to_stages() {
        let trace = Arc::new(Trace::default());
        let p = pipeline(true, Flow::Proceed, &trace);
        assert_eq!(p.stage_names(), vec!["retry", "gate"]);

        let outcome = p.run(&task()).await;

        assert!(matches!(outcome, Outcome::Failed { retried: true, .. }));
        assert_eq!(
            trace.events(),
            vec!["before retry", "before gate", "handle", "failure retry", "failure gate"]
        );
    }
}
