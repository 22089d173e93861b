//! Key layout of the coordination state in the shared store.

use buildgate_core::{BuildId, JobId};

/// Builds every key the gate reads or writes.
///
/// All keys carry the configured prefix except delete markers, which are
/// written by the build API and use a fixed format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Running lock of a job; value is the admitted build id.
    pub fn running(&self, job: JobId) -> String {
        format!("{}running_job_{}", self.prefix, job)
    }

    /// Shadow copy of the running lock kept by the build API.
    pub fn last_running(&self, job: JobId) -> String {
        format!("last_{}running_job_{}", self.prefix, job)
    }

    /// Waiting queue of a job; a list of denied build ids.
    pub fn waiting(&self, job: JobId) -> String {
        format!("{}waiting_job_{}", self.prefix, job)
    }

    /// Delete marker signalling that a build was cancelled before it ran.
    pub fn deleted(&self, job: JobId, build: BuildId) -> String {
        format!("deleted_{}_{}", job, build)
    }

    /// Hash of build id to build config JSON.
    pub fn build_configs(&self) -> String {
        format!("{}buildConfigs", self.prefix)
    }

    /// Fully qualified name of a queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("beta_");
        let job = JobId::new(777);
        assert_eq!(keys.running(job), "beta_running_job_777");
        assert_eq!(keys.last_running(job), "last_beta_running_job_777");
        assert_eq!(keys.waiting(job), "beta_waiting_job_777");
        assert_eq!(keys.deleted(job, BuildId::new(3)), "deleted_777_3");
        assert_eq!(keys.build_configs(), "beta_buildConfigs");
        assert_eq!(keys.queue("builds"), "beta_builds");
    }
}
