//! Key-value store backends for the build admission gate.
//!
//! Provides the in-process [`MemoryStore`] and the networked [`RedisStore`],
//! both implementing [`buildgate_core::KeyValueStore`].

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use buildgate_core::KeyValueStore;
use std::sync::Arc;
use tracing::info;

/// Connect to the store at `url`, or fall back to a process-local store when
/// no URL is configured.
pub async fn connect(url: Option<&str>) -> StoreResult<Arc<dyn KeyValueStore>> {
    match url {
        Some(url) => {
            info!("Connecting to key-value store...");
            let store = RedisStore::connect(url).await?;
            info!("Key-value store connected");
            Ok(Arc::new(store))
        }
        None => {
            info!("No store URL configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
