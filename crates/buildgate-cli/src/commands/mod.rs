//! CLI command implementations.

use anyhow::{Context, Result};
use buildgate_config::{WorkerConfig, load_worker_config};
use buildgate_core::{BuildId, JobId, KeyValueStore};
use buildgate_scheduler::{ApiStatusReporter, BuildConfigStore, Keys, TimeoutReaper};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Load the worker configuration, defaults when no file is given.
pub fn load_config(path: Option<&Path>, store_url: Option<String>) -> Result<WorkerConfig> {
    let mut config = match path {
        Some(path) => load_worker_config(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if store_url.is_some() {
        config.store.url = store_url;
    }
    Ok(config)
}

pub fn validate(config: &WorkerConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn connect(config: &WorkerConfig) -> Result<(Arc<dyn KeyValueStore>, Keys)> {
    let store = buildgate_store::connect(config.store.url.as_deref())
        .await
        .context("Failed to connect to store")?;
    Ok((store, Keys::new(config.store.prefix.clone())))
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobState {
    job_id: JobId,
    running: Option<String>,
    waiting: Vec<String>,
}

async fn job_state(store: &dyn KeyValueStore, keys: &Keys, job: JobId) -> Result<JobState> {
    let running_key = keys.running(job);
    let waiting_key = keys.waiting(job);
    let (running, waiting) = tokio::try_join!(
        store.get(&running_key),
        store.lrange(&waiting_key, 0, -1),
    )?;
    Ok(JobState {
        job_id: job,
        running,
        waiting,
    })
}

pub async fn inspect(config: &WorkerConfig, job: JobId) -> Result<()> {
    let (store, keys) = connect(config).await?;
    let state = job_state(store.as_ref(), &keys, job).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

/// Mark a build deleted. It is dropped at its next admission attempt.
pub async fn cancel(config: &WorkerConfig, job: JobId, build: BuildId) -> Result<()> {
    let (store, keys) = connect(config).await?;
    store
        .set_with_ttl(&keys.deleted(job, build), "", config.blocked_by.block_timeout)
        .await?;
    println!("Build {} of job {} marked for cancellation", build, job);
    Ok(())
}

fn reaper_for(store: Arc<dyn KeyValueStore>, keys: Keys, config: &WorkerConfig) -> TimeoutReaper {
    let reporter = Arc::new(ApiStatusReporter::new(BuildConfigStore::new(
        store.clone(),
        &keys,
    )));
    TimeoutReaper::new(store, reporter, keys, config.timeout.clone())
}

pub async fn sweep(config: &WorkerConfig) -> Result<()> {
    let (store, keys) = connect(config).await?;
    let summary = reaper_for(store, keys, config).sweep().await?;
    println!(
        "Checked {} build(s): {} timed out, {} dropped",
        summary.checked, summary.timed_out, summary.dropped
    );
    Ok(())
}

pub async fn reaper(config: &WorkerConfig) -> Result<()> {
    let (store, keys) = connect(config).await?;
    let reaper = reaper_for(store, keys, config);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { reaper.run(rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    let _ = tx.send(true);
    handle.await?;
    Ok(())
}
