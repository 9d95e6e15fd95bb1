//! Capabilities the engine consumes.
//!
//! The engine never implements persistence, transport or eviction itself.
//! It talks to collaborators through these traits:
//!
//! - [`Cache`]: in-memory lookup with an opaque eviction policy
//! - [`SourceOfTruth`]: the durable local store
//! - [`Fetcher`]: the remote read transport
//! - [`Updater`]: the remote write transport
//! - [`Bookkeeper`]: persisted record of failed syncs
//!
//! Implementations must be thread-safe; the engine shares them behind `Arc`.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;

use crate::error::DepotResult;
use crate::outcome::{FetcherResult, UpdaterResult};
use crate::{StoreKey, StoreValue, Timestamp};

/// In-memory cache keyed by `K`.
///
/// Lookups are synchronous; the eviction policy is the implementation's
/// business.
pub trait Cache<K, V>: Send + Sync {
    /// Get a value if present and not expired.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace a value.
    fn put(&self, key: K, value: V);

    /// Drop one entry.
    fn invalidate(&self, key: &K);

    /// Drop every entry.
    fn invalidate_all(&self);
}

/// Durable local store treated as authoritative over the memory cache.
///
/// `reader` returns a stream that emits the current value (`None` when
/// nothing is stored) and keeps emitting whenever the stored value changes.
/// A read failure is reported as an `Err` item.
#[async_trait]
pub trait SourceOfTruth<K: StoreKey, V: StoreValue>: Send + Sync {
    /// Observe the value stored under `key`.
    fn reader(&self, key: &K) -> BoxStream<'static, DepotResult<Option<V>>>;

    /// Persist `value` under `key`.
    async fn write(&self, key: &K, value: V) -> DepotResult<()>;

    /// Remove the value stored under `key`.
    async fn delete(&self, key: &K) -> DepotResult<()>;

    /// Remove every stored value.
    async fn delete_all(&self) -> DepotResult<()>;
}

/// Remote read transport.
///
/// Each call starts one remote operation. The returned stream may emit any
/// number of results; an empty stream means the origin had nothing new.
pub trait Fetcher<K, V>: Send + Sync {
    fn fetch(&self, key: &K) -> BoxStream<'static, FetcherResult<V>>;
}

/// Remote write transport.
#[async_trait]
pub trait Updater<K: StoreKey, V: StoreValue, R: Send + Sync + 'static>: Send + Sync {
    /// Post `value` for `key` to the remote origin.
    async fn post(&self, key: &K, value: V) -> UpdaterResult<R>;

    /// Hook invoked once per resolved write on success, and once per failed
    /// post.
    fn on_completion(&self, _result: &UpdaterResult<R>) {}
}

/// Persisted record of keys whose local writes may not have reached the
/// remote origin.
#[async_trait]
pub trait Bookkeeper<K: StoreKey>: Send + Sync {
    /// When the last sync for `key` failed, if it has not been cleared since.
    async fn get_last_failed_sync(&self, key: &K) -> DepotResult<Option<Timestamp>>;

    /// Record a failed sync for `key`.
    async fn set_last_failed_sync(&self, key: &K, at: Timestamp) -> DepotResult<()>;

    /// Forget the failed sync for `key`.
    async fn clear(&self, key: &K) -> DepotResult<()>;

    /// Forget every failed sync.
    async fn clear_all(&self) -> DepotResult<()>;
}

/// A failed sync as tracked by a [`Bookkeeper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailureRecord<K> {
    pub key: K,
    pub last_failed_at: Timestamp,
}

// ============================================================================
// FETCHER ADAPTERS
// ============================================================================

/// [`Fetcher`] built from an async function producing a single result.
pub struct FnFetcher<K, V, F> {
    f: F,
    _marker: PhantomData<fn(K) -> V>,
}

/// Build a [`Fetcher`] whose every fetch yields exactly one result.
pub fn fetcher_fn<K, V, F, Fut>(f: F) -> FnFetcher<K, V, F>
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = FetcherResult<V>> + Send + 'static,
{
    FnFetcher {
        f,
        _marker: PhantomData,
    }
}

impl<K, V, F, Fut> Fetcher<K, V> for FnFetcher<K, V, F>
where
    K: StoreKey,
    V: StoreValue,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = FetcherResult<V>> + Send + 'static,
{
    fn fetch(&self, key: &K) -> BoxStream<'static, FetcherResult<V>> {
        let fut: BoxFuture<'static, FetcherResult<V>> = Box::pin((self.f)(key.clone()));
        stream::once(fut).boxed()
    }
}
