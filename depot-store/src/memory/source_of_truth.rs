//! In-memory source of truth.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use depot_core::{DepotResult, SourceOfTruth, StoreKey, StoreValue};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// [`SourceOfTruth`] backed by one watch channel per key.
///
/// Readers see the current value immediately and every later change. Useful
/// when no durable store exists but readers should still observe writes.
pub struct InMemorySourceOfTruth<K, V> {
    cells: Mutex<HashMap<K, watch::Sender<Option<V>>>>,
}

impl<K: StoreKey, V: StoreValue> InMemorySourceOfTruth<K, V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<K, watch::Sender<Option<V>>>> {
        self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current value for `key`, without subscribing.
    pub fn current(&self, key: &K) -> Option<V> {
        self.cells().get(key).and_then(|cell| cell.borrow().clone())
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.cells()
            .values()
            .filter(|cell| cell.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: StoreKey, V: StoreValue> Default for InMemorySourceOfTruth<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> SourceOfTruth<K, V> for InMemorySourceOfTruth<K, V> {
    fn reader(&self, key: &K) -> BoxStream<'static, DepotResult<Option<V>>> {
        let rx = self
            .cells()
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        WatchStream::new(rx).map(Ok).boxed()
    }

    async fn write(&self, key: &K, value: V) -> DepotResult<()> {
        let mut cells = self.cells();
        match cells.get(key) {
            Some(cell) => {
                cell.send_replace(Some(value));
            }
            None => {
                cells.insert(key.clone(), watch::channel(Some(value)).0);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &K) -> DepotResult<()> {
        if let Some(cell) = self.cells().get(key) {
            cell.send_replace(None);
        }
        Ok(())
    }

    async fn delete_all(&self) -> DepotResult<()> {
        for cell in self.cells().values() {
            cell.send_replace(None);
        }
        Ok(())
    }
}
