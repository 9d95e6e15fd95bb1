//! Stores that accept local writes.

use std::sync::Arc;

use async_stream::stream;
use depot_core::{
    DepotResult, ReadOutcome, ReadRequest, StoreKey, StoreValue, WriteOutcome, WriteRequest,
};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tracing::{debug, error, warn};

use crate::conflict::{ConflictResolver, EagerResolution};
use crate::ledger::WriteRequestLedger;
use crate::store::{first_value, Store};

/// A [`Store`] whose keys can be written locally and synced to the remote
/// origin.
///
/// Writes show up locally right away; the remote post follows. Reads first
/// try to sync any key with unacknowledged writes.
pub struct MutableStore<K: StoreKey, V: StoreValue, R> {
    store: Store<K, V>,
    ledger: Arc<WriteRequestLedger<K, V, R>>,
    resolver: Arc<ConflictResolver<K, V, R>>,
}

impl<K: StoreKey, V: StoreValue, R> Clone for MutableStore<K, V, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledger: Arc::clone(&self.ledger),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<K, V, R> MutableStore<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        store: Store<K, V>,
        ledger: Arc<WriteRequestLedger<K, V, R>>,
        resolver: Arc<ConflictResolver<K, V, R>>,
    ) -> Self {
        Self {
            store,
            ledger,
            resolver,
        }
    }

    /// Stream outcomes for `request`, after an eager conflict resolution
    /// attempt for its key.
    pub fn stream(&self, request: ReadRequest<K>) -> BoxStream<'static, ReadOutcome<V>> {
        let this = self.clone();
        stream! {
            let resolution = this.resolver.eagerly_resolve_conflicts(&request.key).await;
            match &resolution {
                EagerResolution::NoConflicts => {
                    debug!(key = ?request.key, "No conflicts to resolve");
                }
                EagerResolution::ConflictsResolved(_) => {
                    debug!(key = ?request.key, "Conflicts resolved before read");
                }
                EagerResolution::Failed(failure) => {
                    error!(
                        key = ?request.key,
                        error = %failure,
                        "Eager conflict resolution failed"
                    );
                }
            }

            let mut events = this.store.stream(request);
            while let Some(event) = events.next().await {
                yield event;
            }
        }
        .boxed()
    }

    /// Write one value: show it locally, queue it, post the newest queued
    /// value for its key.
    ///
    /// A failed local write is returned without posting. The write stays
    /// queued and the key is marked unsynced, so the next read retries it.
    pub async fn write(&self, request: WriteRequest<K, V, R>) -> WriteOutcome<R> {
        let key = request.key.clone();
        let value = request.value.clone();
        let pending = self.ledger.push(request);

        if let Err(error) = self.store.write_local(&key, value).await {
            warn!(key = ?key, error = %error, "Local write failed, left queued");
            self.resolver.mark_unsynced(&key).await;
            return WriteOutcome::Error(error);
        }
        self.resolver.post_latest(&key, pending).await
    }

    /// Write each request in turn, yielding one outcome per request.
    pub fn write_all<S>(&self, requests: S) -> BoxStream<'static, WriteOutcome<R>>
    where
        S: Stream<Item = WriteRequest<K, V, R>> + Send + 'static,
    {
        let this = self.clone();
        let mut requests = requests.boxed();
        stream! {
            while let Some(request) = requests.next().await {
                yield this.write(request).await;
            }
        }
        .boxed()
    }

    /// First value for `key`, after eager conflict resolution.
    pub async fn get(&self, key: K) -> DepotResult<V> {
        let events = self.stream(ReadRequest::cached(key.clone(), false));
        first_value(events, &key, self.store.has_source_of_truth()).await
    }

    /// First value for `key` after a forced fetch.
    pub async fn fresh(&self, key: K) -> DepotResult<V> {
        let events = self.stream(ReadRequest::fresh(key.clone()));
        first_value(events, &key, self.store.has_source_of_truth()).await
    }

    pub async fn clear(&self, key: &K) -> DepotResult<()> {
        self.store.clear(key).await
    }

    pub async fn clear_all(&self) -> DepotResult<()> {
        self.store.clear_all().await
    }

    /// Attempt to sync `key` now.
    pub async fn resolve_conflicts(&self, key: &K) -> EagerResolution<R> {
        self.resolver.eagerly_resolve_conflicts(key).await
    }

    /// Number of unacknowledged writes queued for `key`.
    pub fn pending_writes(&self, key: &K) -> usize {
        self.ledger.len(key)
    }

    /// The underlying read-only store.
    pub fn store(&self) -> &Store<K, V> {
        &self.store
    }
}
