//! Build config records.

use buildgate_core::{BuildConfig, BuildId, KeyValueStore, Result};
use std::sync::Arc;

use crate::keys::Keys;

/// Build config table in the shared store, keyed by build id.
///
/// Records are written when a build is queued and deleted by whichever of
/// stop, cancel or the timeout reaper resolves the build first. A missing
/// record means the build has already been resolved.
#[derive(Clone)]
pub struct BuildConfigStore {
    store: Arc<dyn KeyValueStore>,
    table: String,
}

impl BuildConfigStore {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: &Keys) -> Self {
        Self {
            store,
            table: keys.build_configs(),
        }
    }

    /// Read and parse a record. A record that does not parse is an error.
    pub async fn get(&self, build_id: BuildId) -> Result<Option<BuildConfig>> {
        self.get_raw(&build_id.to_string()).await
    }

    pub(crate) async fn get_raw(&self, field: &str) -> Result<Option<BuildConfig>> {
        match self.store.hget(&self.table, field).await? {
            None => Ok(None),
            Some(json) => Ok(serde_json::from_str(&json)?),
        }
    }

    pub async fn put(&self, config: &BuildConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        self.store
            .hset(&self.table, &config.build_id.to_string(), &json)
            .await
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, build_id: BuildId) -> Result<bool> {
        self.delete_raw(&build_id.to_string()).await
    }

    pub(crate) async fn delete_raw(&self, field: &str) -> Result<bool> {
        self.store.hdel(&self.table, field).await
    }

    /// Raw ids of every record, including ones that may not parse.
    pub async fn ids(&self) -> Result<Vec<String>> {
        self.store.hkeys(&self.table).await
    }
}
