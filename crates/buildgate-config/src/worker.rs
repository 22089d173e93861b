//! Worker configuration parsing.
//!
//! ```kdl
//! store url="redis://127.0.0.1:6379" prefix="beta_"
//! queue name="builds"
//! worker processors=4 poll-interval-ms=1000 cluster="us-west"
//! blocked-by block-timeout=120 reenqueue-wait-time=1 blocked-by-self=#true collapse=#false
//! retry limit=3 delay-secs=5
//! timeout default-minutes=60 buffer-minutes=1 sweep-interval-secs=60
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const MINUTE: u64 = 60;

/// Everything a worker process needs, parsed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub worker: PoolConfig,
    pub blocked_by: BlockedByConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL of the shared key-value store.
    pub url: Option<String>,
    /// Prepended to every key the gate owns.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "builds".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrent worker slots.
    pub processors: usize,
    /// How long an idle slot waits before polling the queue again.
    pub poll_interval: Duration,
    /// Cluster label of this pool. Builds routed elsewhere are re-enqueued.
    pub cluster: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processors: 1,
            poll_interval: Duration::from_millis(1000),
            cluster: None,
        }
    }
}

/// Options of the admission gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedByConfig {
    /// TTL of a running lock. Same order as a build timeout, so a lock whose
    /// release never happens does not block its job forever.
    pub block_timeout: Duration,
    /// Delay before a denied build is delivered again.
    pub reenqueue_wait_time: Duration,
    /// Serialize builds of the same job.
    pub blocked_by_self: bool,
    /// Supersede older waiting builds of the same job with the newest.
    pub collapse: bool,
}

impl Default for BlockedByConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(120 * MINUTE),
            reenqueue_wait_time: Duration::from_secs(MINUTE),
            blocked_by_self: false,
            collapse: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed before a task is given up on.
    pub limit: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Build timeout when the build carries no timeout annotation.
    pub default_build_timeout: Duration,
    /// Grace added on top of every build timeout.
    pub buffer: Duration,
    /// Interval between reaper sweeps.
    pub sweep_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_build_timeout: Duration::from_secs(60 * MINUTE),
            buffer: Duration::from_secs(MINUTE),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Read and parse a worker configuration file.
pub fn load_worker_config(path: impl AsRef<Path>) -> ConfigResult<WorkerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_worker_config(&text)
}

/// Parse a worker configuration from KDL text.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = WorkerConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        let known = matches!(
            name,
            "store" | "queue" | "worker" | "blocked-by" | "retry" | "timeout"
        );
        if known && !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }

        match name {
            "store" => {
                if let Some(url) = get_string_prop(node, "url")? {
                    config.store.url = Some(url);
                }
                if let Some(prefix) = get_string_prop(node, "prefix")? {
                    config.store.prefix = prefix;
                }
            }
            "queue" => {
                if let Some(queue) = get_string_prop(node, "name")? {
                    config.queue.name = queue;
                }
            }
            "worker" => {
                if let Some(n) = get_u64_prop(node, "processors")? {
                    config.worker.processors = n as usize;
                }
                if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
                    config.worker.poll_interval = Duration::from_millis(ms);
                }
                config.worker.cluster = get_string_prop(node, "cluster")?;
            }
            "blocked-by" => {
                let b = &mut config.blocked_by;
                if let Some(d) = get_minutes_prop(node, "block-timeout")? {
                    b.block_timeout = d;
                }
                if let Some(d) = get_minutes_prop(node, "reenqueue-wait-time")? {
                    b.reenqueue_wait_time = d;
                }
                if let Some(v) = get_bool_prop(node, "blocked-by-self")? {
                    b.blocked_by_self = v;
                }
                if let Some(v) = get_bool_prop(node, "collapse")? {
                    b.collapse = v;
                }
            }
            "retry" => {
                if let Some(n) = get_u64_prop(node, "limit")? {
                    config.retry.limit = u32::try_from(n)
                        .map_err(|_| ConfigError::invalid("retry limit", "out of range"))?;
                }
                if let Some(s) = get_u64_prop(node, "delay-secs")? {
                    config.retry.delay = Duration::from_secs(s);
                }
            }
            "timeout" => {
                let t = &mut config.timeout;
                if let Some(d) = get_minutes_prop(node, "default-minutes")? {
                    t.default_build_timeout = d;
                }
                if let Some(d) = get_minutes_prop(node, "buffer-minutes")? {
                    t.buffer = d;
                }
                if let Some(s) = get_u64_prop(node, "sweep-interval-secs")? {
                    t.sweep_interval = Duration::from_secs(s);
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &WorkerConfig) -> ConfigResult<()> {
    if config.blocked_by.block_timeout.is_zero() {
        return Err(ConfigError::invalid("block-timeout", "must be positive"));
    }
    if config.blocked_by.reenqueue_wait_time.is_zero() {
        return Err(ConfigError::invalid(
            "reenqueue-wait-time",
            "must be positive",
        ));
    }
    if config.worker.processors == 0 {
        return Err(ConfigError::invalid("processors", "must be positive"));
    }
    if config.timeout.sweep_interval.is_zero() {
        return Err(ConfigError::invalid("sweep-interval-secs", "must be positive"));
    }
    if config.queue.name.is_empty() {
        return Err(ConfigError::invalid("queue name", "must not be empty"));
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes.
// Deployment tooling often renders every value as a string, so numbers and
// booleans are accepted in string form too.

fn get_string_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<String>> {
    match node.get(name) {
        None | Some(KdlValue::Null) => Ok(None),
        Some(KdlValue::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ConfigError::invalid(
            name,
            format!("expected a string, got {other}"),
        )),
    }
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None | Some(KdlValue::Null) => Ok(None),
        Some(KdlValue::Integer(i)) => u64::try_from(*i)
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, format!("{i} is out of range"))),
        Some(KdlValue::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, format!("{s:?} is not a whole number"))),
        Some(other) => Err(ConfigError::invalid(
            name,
            format!("expected a whole number, got {other}"),
        )),
    }
}

/// A whole number of minutes. Store TTLs are signed milliseconds, which
/// bounds the range.
fn get_minutes_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    let Some(m) = get_u64_prop(node, name)? else {
        return Ok(None);
    };
    m.checked_mul(MINUTE * 1000)
        .filter(|ms| i64::try_from(*ms).is_ok())
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| ConfigError::invalid(name, format!("{m} minutes is out of range")))
}

fn get_bool_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<bool>> {
    match node.get(name) {
        None | Some(KdlValue::Null) => Ok(None),
        Some(KdlValue::Bool(b)) => Ok(Some(*b)),
        Some(KdlValue::String(s)) => match s.trim() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(ConfigError::invalid(
                name,
                format!("{s:?} is not a boolean"),
            )),
        },
        Some(other) => Err(ConfigError::invalid(
            name,
            format!("expected a boolean, got {other}"),
        )),
    }
}
