//! In-memory sync-failure bookkeeping.

use std::collections::HashMap;

use async_trait::async_trait;
use depot_core::{Bookkeeper, DepotResult, StoreKey, SyncFailureRecord, Timestamp};
use tokio::sync::RwLock;

/// [`Bookkeeper`] that keeps failed-sync records in memory.
///
/// Records are lost with the process; use a persisted implementation when
/// unsynced writes must survive restarts.
#[derive(Debug)]
pub struct InMemoryBookkeeper<K> {
    records: RwLock<HashMap<K, Timestamp>>,
}

impl<K: StoreKey> InMemoryBookkeeper<K> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of all recorded failures.
    pub async fn records(&self) -> Vec<SyncFailureRecord<K>> {
        self.records
            .read()
            .await
            .iter()
            .map(|(key, at)| SyncFailureRecord {
                key: key.clone(),
                last_failed_at: *at,
            })
            .collect()
    }
}

impl<K: StoreKey> Default for InMemoryBookkeeper<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: StoreKey> Bookkeeper<K> for InMemoryBookkeeper<K> {
    async fn get_last_failed_sync(&self, key: &K) -> DepotResult<Option<Timestamp>> {
        Ok(self.records.read().await.get(key).copied())
    }

    async fn set_last_failed_sync(&self, key: &K, at: Timestamp) -> DepotResult<()> {
        self.records.write().await.insert(key.clone(), at);
        Ok(())
    }

    async fn clear(&self, key: &K) -> DepotResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> DepotResult<()> {
        self.records.write().await.clear();
        Ok(())
    }
}
