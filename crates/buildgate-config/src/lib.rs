//! KDL configuration parsing for the build admission gate.
//!
//! Raw configuration is parsed and validated once, at startup, into
//! [`WorkerConfig`]. Nothing downstream sees untyped options.

pub mod error;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use worker::{
    BlockedByConfig, PoolConfig, QueueConfig, RetryConfig, StoreConfig, TimeoutConfig,
    WorkerConfig, load_worker_config, parse_worker_config,
};
