//! Timeout reaper.
//!
//! Periodically walks the build config table and fails builds that have been
//! queued or running for longer than their timeout, releasing whatever
//! coordination state they still hold.

use buildgate_config::TimeoutConfig;
use buildgate_core::{BuildConfig, BuildStatus, KeyValueStore, Result, StatusReporter};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::keys::Keys;
use crate::records::BuildConfigStore;

/// Exit code recorded on the step a timed out build was running.
const TIMEOUT_CODE: i32 = 3;

/// What happened to one build config record during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checked {
    Alive,
    Gone,
    TimedOut,
    Dropped,
}

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub timed_out: usize,
    /// Records removed because they could not be processed.
    pub dropped: usize,
}

pub struct TimeoutReaper {
    store: Arc<dyn KeyValueStore>,
    reporter: Arc<dyn StatusReporter>,
    records: BuildConfigStore,
    keys: Keys,
    options: TimeoutConfig,
}

impl TimeoutReaper {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        reporter: Arc<dyn StatusReporter>,
        keys: Keys,
        options: TimeoutConfig,
    ) -> Self {
        let records = BuildConfigStore::new(store.clone(), &keys);
        Self {
            store,
            reporter,
            records,
            keys,
            options,
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.options.sweep_interval, "Starting timeout reaper");
        let mut ticker = tokio::time::interval(self.options.sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(summary) if summary.timed_out > 0 || summary.dropped > 0 => {
                            info!(?summary, "Timeout sweep finished");
                        }
                        Ok(summary) => debug!(?summary, "Timeout sweep finished"),
                        Err(e) => warn!(error = %e, "Timeout sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Timeout reaper stopped");
    }

    pub async fn sweep(&self) -> Result<SweepSummary> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    ///
    /// Records are checked concurrently and independently: one record
    /// failing never stops the others.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let ids = self.records.ids().await?;
        let results = join_all(ids.iter().map(|id| self.check(id, now))).await;

        let mut summary = SweepSummary {
            checked: ids.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Checked::TimedOut => summary.timed_out += 1,
                Checked::Dropped => summary.dropped += 1,
                Checked::Alive | Checked::Gone => {}
            }
        }
        Ok(summary)
    }

    async fn check(&self, id: &str, now: DateTime<Utc>) -> Checked {
        match self.try_check(id, now).await {
            Ok(checked) => checked,
            Err(e) => {
                error!(build_id = %id, error = %e, "Failed to check build for timeout, removing record");
                if let Err(e) = self.records.delete_raw(id).await {
                    warn!(build_id = %id, error = %e, "Failed to remove build config");
                }
                Checked::Dropped
            }
        }
    }

    async fn try_check(&self, id: &str, now: DateTime<Utc>) -> Result<Checked> {
        // Resolved between listing and reading.
        let Some(config) = self.records.get_raw(id).await? else {
            return Ok(Checked::Gone);
        };
        let Some(enqueued) = config.enqueue_time else {
            warn!(build_id = %config.build_id, "Build config has no enqueueTime, skipping");
            return Ok(Checked::Alive);
        };

        let timeout = self.timeout_minutes(&config);
        let elapsed = elapsed_minutes(enqueued, now);
        if elapsed <= timeout {
            return Ok(Checked::Alive);
        }

        info!(build_id = %config.build_id, job_id = %config.job_id, elapsed, timeout, "Build timed out");
        self.expire(&config).await?;
        Ok(Checked::TimedOut)
    }

    /// Annotated timeout, or the default, plus the grace buffer.
    fn timeout_minutes(&self, config: &BuildConfig) -> i64 {
        let base = config
            .annotations
            .timeout_minutes()
            .unwrap_or_else(|| minutes(self.options.default_build_timeout));
        i64::try_from(base.saturating_add(minutes(self.options.buffer))).unwrap_or(i64::MAX)
    }

    async fn expire(&self, config: &BuildConfig) -> Result<()> {
        let build = config.build_id;
        let job = config.job_id;

        match self.reporter.stop_active_step(build, TIMEOUT_CODE).await {
            Ok(Some(step)) => debug!(build_id = %build, %step, "Stopped active step of timed out build"),
            Ok(None) => {}
            Err(e) => warn!(build_id = %build, error = %e, "Failed to stop active step"),
        }

        let message = format!("Failed build: {} due to timeout", build);
        if let Err(e) = self
            .reporter
            .report(build, BuildStatus::Failure, &message)
            .await
        {
            warn!(build_id = %build, error = %e, "Failed to report build timeout");
        }

        self.records.delete(build).await?;

        let running_key = self.keys.running(job);
        let last_running_key = self.keys.last_running(job);
        let delete_key = self.keys.deleted(job, build);
        let waiting_key = self.keys.waiting(job);
        let build_str = build.to_string();
        tokio::try_join!(
            self.store.expire(&running_key, Duration::ZERO),
            self.store.expire(&last_running_key, Duration::ZERO),
            self.store.del(&delete_key),
            self.store.lrem(&waiting_key, 0, &build_str),
        )?;
        Ok(())
    }
}

fn minutes(duration: Duration) -> u64 {
    duration.as_secs() / 60
}

/// Whole minutes since `since`, rounded to the nearest minute.
fn elapsed_minutes(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (now - since).num_milliseconds();
    (millis as f64 / 60_000.0).round() as i64
}
