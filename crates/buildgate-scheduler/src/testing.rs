//! Recording fakes for the external collaborators.

use async_trait::async_trait;
use buildgate_core::{
    BuildConfig, BuildExecutor, BuildId, BuildStatus, Error, Result, StatusReporter, StopRequest,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub build_id: BuildId,
    pub status: BuildStatus,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
    stopped_steps: Mutex<Vec<(BuildId, i32)>>,
    fail: AtomicBool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let reporter = Self::default();
        reporter.fail.store(true, Ordering::SeqCst);
        reporter
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    pub fn stopped_steps(&self) -> Vec<(BuildId, i32)> {
        self.stopped_steps.lock().unwrap().clone()
    }

    pub fn statuses_for(&self, build_id: u64) -> Vec<BuildStatus> {
        self.reports()
            .into_iter()
            .filter(|r| r.build_id.get() == build_id)
            .map(|r| r.status)
            .collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, build_id: BuildId, status: BuildStatus, message: &str) -> Result<()> {
        self.reports.lock().unwrap().push(Report {
            build_id,
            status,
            message: message.to_string(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Reporter("api unavailable".to_string()));
        }
        Ok(())
    }

    async fn stop_active_step(&self, build_id: BuildId, code: i32) -> Result<Option<String>> {
        self.stopped_steps.lock().unwrap().push((build_id, code));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Reporter("api unavailable".to_string()));
        }
        Ok(Some("test".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingExecutor {
    started: Mutex<Vec<BuildConfig>>,
    stopped: Mutex<Vec<StopRequest>>,
    fail: AtomicBool,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<BuildId> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.build_id)
            .collect()
    }

    pub fn stopped(&self) -> Vec<StopRequest> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildExecutor for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start(&self, config: &BuildConfig) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Executor("container failed to start".to_string()));
        }
        self.started.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn stop(&self, request: &StopRequest) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Executor("container failed to stop".to_string()));
        }
        self.stopped.lock().unwrap().push(request.clone());
        Ok(())
    }
}
