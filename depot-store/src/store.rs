//! Read orchestration.
//!
//! [`Store`] composes the memory cache, the source-of-truth barrier and the
//! fetch multicaster into one stream per read request.
//!
//! With a source of truth, values always reach the caller through the
//! barrier: fetched values are written first and re-emitted by the reader.
//! Two gates coordinate the halves. The disk gate holds the reader back for
//! `Fresh` requests until the fetcher has answered; the network gate holds
//! the fetch back until the reader has shown there is nothing local (or the
//! request asked for a refresh).

use std::sync::Arc;

use async_stream::stream;
use depot_core::{
    key_label, Cache, DepotError, DepotResult, ReadOrigin, ReadOutcome, ReadRequest,
    SourceOfTruthError, StoreConfig, StoreKey, StoreValue,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use tracing::{debug, trace};

use crate::barrier::SourceOfTruthBarrier;
use crate::latch::Latch;
use crate::multicast::FetcherMulticaster;

/// Which half of a disk/network merge an event came from.
enum Side<V> {
    Network(ReadOutcome<V>),
    Disk(ReadOutcome<Option<V>>),
}

pub(crate) struct StoreInner<K: StoreKey, V: StoreValue> {
    pub(crate) cache: Option<Arc<dyn Cache<K, V>>>,
    pub(crate) barrier: Option<Arc<SourceOfTruthBarrier<K, V>>>,
    pub(crate) multicaster: Arc<FetcherMulticaster<K, V>>,
    pub(crate) config: StoreConfig,
}

impl<K: StoreKey, V: StoreValue> StoreInner<K, V> {
    fn cached(&self, key: &K) -> Option<V> {
        self.cache.as_ref().and_then(|cache| cache.get(key))
    }

    /// Mirror a value the caller is about to see into the memory cache.
    fn remember(&self, request: &ReadRequest<K>, outcome: &ReadOutcome<V>) {
        if request.skips_memory() {
            return;
        }
        if let (Some(cache), ReadOutcome::Data { value, origin }) = (&self.cache, outcome) {
            if *origin != ReadOrigin::Cache {
                cache.put(request.key.clone(), value.clone());
            }
        }
    }

    fn network(
        &self,
        key: K,
        gate: Option<Latch>,
        piggyback_only: bool,
    ) -> BoxStream<'static, ReadOutcome<V>> {
        let multicaster = Arc::clone(&self.multicaster);
        stream! {
            if let Some(gate) = gate {
                gate.wait().await;
                debug!(key = ?key, "Fetch gate opened");
            }
            let mut events = multicaster.subscribe(&key, piggyback_only);
            if !piggyback_only {
                yield ReadOutcome::loading(ReadOrigin::Fetcher);
            }
            while let Some(event) = events.next().await {
                yield event;
            }
        }
        .boxed()
    }

    fn disk_network_combined(
        &self,
        request: &ReadRequest<K>,
        barrier: &Arc<SourceOfTruthBarrier<K, V>>,
    ) -> BoxStream<'static, ReadOutcome<V>> {
        let disk_gate = Latch::new();
        let network_gate = Latch::new();
        let skip_disk = request.skips_source_of_truth();
        let refresh = request.refresh();
        if !skip_disk {
            disk_gate.open();
        }

        let disk = barrier.reader(request.key.clone(), disk_gate.clone());
        if skip_disk {
            network_gate.open();
        }
        let network = self.network(request.key.clone(), Some(network_gate.clone()), false);
        let mut merged = stream::select(network.map(Side::Network), disk.map(Side::Disk));

        stream! {
            // Set once each half has come up empty; both together mean there
            // is nothing to serve.
            let mut fetched_nothing = false;
            let mut disk_missing = false;
            while let Some(event) = merged.next().await {
                match event {
                    Side::Network(outcome) => {
                        let answered = matches!(
                            outcome,
                            ReadOutcome::Data { .. } | ReadOutcome::NoNewData { .. }
                        );
                        if answered {
                            disk_gate.open();
                        }
                        if matches!(outcome, ReadOutcome::NoNewData { .. }) {
                            fetched_nothing = true;
                        }
                        // Fetched data comes back through the barrier.
                        if !outcome.is_data() {
                            yield outcome;
                        }
                    }
                    Side::Disk(ReadOutcome::Data { value, origin }) => {
                        let missing = value.is_none();
                        disk_missing = missing;
                        if let Some(value) = value {
                            yield ReadOutcome::data(value, origin);
                        }
                        if refresh || missing {
                            network_gate.open();
                        }
                    }
                    Side::Disk(ReadOutcome::Error { error, origin }) => {
                        let read_failed = matches!(
                            error,
                            DepotError::SourceOfTruth(SourceOfTruthError::ReadFailed { .. })
                        );
                        yield ReadOutcome::Error { error, origin };
                        // Write errors wait for the read that follows them.
                        if read_failed {
                            network_gate.open();
                        }
                    }
                    Side::Disk(ReadOutcome::Loading { .. } | ReadOutcome::NoNewData { .. }) => {}
                }
                if fetched_nothing && disk_missing {
                    fetched_nothing = false;
                    disk_missing = false;
                    yield ReadOutcome::no_new_data(ReadOrigin::SourceOfTruth);
                }
            }
        }
        .boxed()
    }

    fn local_only(&self, key: K, cached: Option<V>) -> BoxStream<'static, ReadOutcome<V>> {
        match &self.barrier {
            Some(barrier) => barrier
                .reader(key, Latch::opened())
                .map(|outcome| match outcome {
                    ReadOutcome::Data {
                        value: Some(value),
                        origin,
                    } => ReadOutcome::data(value, origin),
                    ReadOutcome::Data { value: None, .. } => {
                        ReadOutcome::no_new_data(ReadOrigin::SourceOfTruth)
                    }
                    ReadOutcome::Error { error, origin } => ReadOutcome::Error { error, origin },
                    ReadOutcome::Loading { origin } => ReadOutcome::Loading { origin },
                    ReadOutcome::NoNewData { origin } => ReadOutcome::NoNewData { origin },
                })
                .boxed(),
            None if cached.is_none() => {
                stream::once(async { ReadOutcome::no_new_data(ReadOrigin::Cache) }).boxed()
            }
            None => stream::empty().boxed(),
        }
    }
}

/// Cached, durable and remote reads of keyed data.
///
/// Cloning is cheap; clones share caches, barrier cells and fetches.
pub struct Store<K: StoreKey, V: StoreValue> {
    pub(crate) inner: Arc<StoreInner<K, V>>,
}

impl<K: StoreKey, V: StoreValue> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Stream outcomes for `request`.
    ///
    /// The stream keeps observing the key (source-of-truth changes and later
    /// fetches) until it is dropped.
    pub fn stream(&self, request: ReadRequest<K>) -> BoxStream<'static, ReadOutcome<V>> {
        let inner = Arc::clone(&self.inner);
        stream! {
            let key = request.key.clone();
            let cached = if request.skips_memory() { None } else { inner.cached(&key) };
            if let Some(value) = cached.clone() {
                trace!(key = ?key, "Memory cache hit");
                yield ReadOutcome::data(value, ReadOrigin::Cache);
            }

            let mut upstream = if request.is_local_only() {
                inner.local_only(key.clone(), cached.clone())
            } else {
                match &inner.barrier {
                    Some(barrier) => inner.disk_network_combined(&request, barrier),
                    None => {
                        let piggyback_only = !request.refresh() && cached.is_some();
                        inner.network(key.clone(), None, piggyback_only)
                    }
                }
            };

            while let Some(outcome) = upstream.next().await {
                let no_new_data = matches!(outcome, ReadOutcome::NoNewData { .. });
                inner.remember(&request, &outcome);
                yield outcome;

                // Nothing new from the origin: fall back to whatever the cache has.
                if no_new_data && cached.is_none() {
                    if let Some(value) = inner.cached(&key) {
                        yield ReadOutcome::data(value, ReadOrigin::Cache);
                    }
                }
            }
        }
        .boxed()
    }

    /// First value for `key`, from the cache, the source of truth or a fetch.
    pub async fn get(&self, key: K) -> DepotResult<V> {
        let events = self.stream(ReadRequest::cached(key.clone(), false));
        first_value(events, &key, self.has_source_of_truth()).await
    }

    /// First value for `key` after a forced fetch.
    pub async fn fresh(&self, key: K) -> DepotResult<V> {
        let events = self.stream(ReadRequest::fresh(key.clone()));
        first_value(events, &key, self.has_source_of_truth()).await
    }

    /// Drop `key` from the memory cache and the source of truth.
    pub async fn clear(&self, key: &K) -> DepotResult<()> {
        if let Some(cache) = &self.inner.cache {
            cache.invalidate(key);
        }
        if let Some(barrier) = &self.inner.barrier {
            barrier.delete(key).await?;
        }
        Ok(())
    }

    /// Drop every key from the memory cache and the source of truth.
    pub async fn clear_all(&self) -> DepotResult<()> {
        if let Some(cache) = &self.inner.cache {
            cache.invalidate_all();
        }
        if let Some(barrier) = &self.inner.barrier {
            barrier.delete_all().await?;
        }
        Ok(())
    }

    /// Make a locally written value visible: cache it and write it through
    /// the barrier so attached readers observe it. A failed durable write is
    /// returned as well as delivered to readers.
    pub(crate) async fn write_local(&self, key: &K, value: V) -> DepotResult<()> {
        if let Some(cache) = &self.inner.cache {
            cache.put(key.clone(), value.clone());
        }
        if let Some(barrier) = &self.inner.barrier {
            if let Some(write_error) = barrier.write_capturing(key, value).await? {
                return Err(write_error);
            }
        }
        Ok(())
    }

    /// Latest locally known value: the memory cache, else the first
    /// source-of-truth read.
    pub(crate) async fn latest_or_none(&self, key: &K) -> Option<V> {
        if let Some(value) = self.inner.cached(key) {
            return Some(value);
        }
        let barrier = self.inner.barrier.as_ref()?;
        let mut reads = barrier.reader(key.clone(), Latch::opened());
        match reads.next().await {
            Some(ReadOutcome::Data { value, .. }) => value,
            _ => None,
        }
    }

    pub(crate) fn has_source_of_truth(&self) -> bool {
        self.inner.barrier.is_some()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Number of keys with a live shared fetch.
    pub fn fetcher_count(&self) -> usize {
        self.inner.multicaster.fetcher_count()
    }

    /// Number of keys with a live barrier cell.
    pub fn barrier_count(&self) -> usize {
        self.inner
            .barrier
            .as_ref()
            .map_or(0, |barrier| barrier.barrier_count())
    }
}

/// Drive `events` to its first value.
///
/// `NoNewData` from the fetcher is not final while a source of truth can
/// still answer. Any other `NoNewData` ends the read unless a cache fallback
/// is emitted right behind it.
pub(crate) async fn first_value<K: StoreKey, V: StoreValue>(
    mut events: BoxStream<'static, ReadOutcome<V>>,
    key: &K,
    has_source_of_truth: bool,
) -> DepotResult<V> {
    let mut awaiting_fallback = false;
    loop {
        let next = if awaiting_fallback {
            match events.next().now_or_never() {
                Some(next) => next,
                None => break,
            }
        } else {
            events.next().await
        };
        let Some(outcome) = next else {
            break;
        };
        awaiting_fallback = false;
        match outcome {
            ReadOutcome::Data { value, .. } => return Ok(value),
            ReadOutcome::Error { error, .. } => return Err(error),
            ReadOutcome::Loading { .. } => {}
            ReadOutcome::NoNewData { origin } => {
                if !(has_source_of_truth && origin == ReadOrigin::Fetcher) {
                    awaiting_fallback = true;
                }
            }
        }
    }
    Err(DepotError::NoData {
        key: key_label(key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StoreBuilder;
    use crate::memory::{InMemorySourceOfTruth, MemoryCache};
    use depot_core::{Fetcher, FetcherResult, MemoryPolicy, SourceOfTruth};
    use depot_test_utils::assertions::assert_data;
    use depot_test_utils::{collect_outcomes, ScriptedFetcher};
    use std::time::Duration;

    type Fixture = (
        Store<u32, String>,
        Arc<ScriptedFetcher<u32, String>>,
        Arc<MemoryCache<u32, String>>,
    );

    fn without_source_of_truth() -> Fixture {
        let fetcher: Arc<ScriptedFetcher<u32, String>> = Arc::new(ScriptedFetcher::new());
        let cache: Arc<MemoryCache<u32, String>> =
            Arc::new(MemoryCache::new(&MemoryPolicy::new().with_max_size(16)));
        let store = StoreBuilder::from_fetcher(fetcher.clone() as Arc<dyn Fetcher<u32, String>>)
            .cache(cache.clone())
            .build()
            .unwrap();
        (store, fetcher, cache)
    }

    fn with_source_of_truth(
        source_of_truth: Arc<InMemorySourceOfTruth<u32, String>>,
    ) -> (Store<u32, String>, Arc<ScriptedFetcher<u32, String>>) {
        let fetcher: Arc<ScriptedFetcher<u32, String>> = Arc::new(ScriptedFetcher::new());
        let store = StoreBuilder::from_fetcher(fetcher.clone() as Arc<dyn Fetcher<u32, String>>)
            .source_of_truth(source_of_truth)
            .build()
            .unwrap();
        (store, fetcher)
    }

    fn data(value: &str) -> FetcherResult<String> {
        FetcherResult::Data(value.to_string())
    }

    async fn stays_quiet(events: &mut BoxStream<'static, ReadOutcome<String>>) -> bool {
        tokio::time::timeout(Duration::from_millis(20), events.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_cache_hit_serves_without_fetching() {
        let (store, fetcher, cache) = without_source_of_truth();
        cache.put(1, "cached".to_string());

        let mut events = store.stream(ReadRequest::cached(1, false));
        let outcomes = collect_outcomes(&mut events, 1).await;
        assert_data(&outcomes[0], &"cached".to_string(), ReadOrigin::Cache);
        assert!(stays_quiet(&mut events).await);
        assert_eq!(fetcher.invocations(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_fetches_and_remembers() {
        let (store, fetcher, cache) = without_source_of_truth();
        fetcher.script(1, vec![data("remote")]);

        let outcomes = collect_outcomes(store.stream(ReadRequest::cached(1, false)), 2).await;
        assert_eq!(outcomes[0], ReadOutcome::loading(ReadOrigin::Fetcher));
        assert_data(&outcomes[1], &"remote".to_string(), ReadOrigin::Fetcher);
        assert_eq!(cache.get(&1), Some("remote".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_serves_cache_then_fetch() {
        let (store, fetcher, cache) = without_source_of_truth();
        cache.put(1, "stale".to_string());
        fetcher.script(1, vec![data("fresh")]);

        let outcomes = collect_outcomes(store.stream(ReadRequest::cached(1, true)), 3).await;
        assert_data(&outcomes[0], &"stale".to_string(), ReadOrigin::Cache);
        assert_eq!(outcomes[1], ReadOutcome::loading(ReadOrigin::Fetcher));
        assert_data(&outcomes[2], &"fresh".to_string(), ReadOrigin::Fetcher);
    }

    #[tokio::test]
    async fn test_fetched_value_comes_back_through_source_of_truth() {
        let source_of_truth: Arc<InMemorySourceOfTruth<u32, String>> =
            Arc::new(InMemorySourceOfTruth::new());
        let (store, fetcher) = with_source_of_truth(source_of_truth.clone());
        fetcher.script(1, vec![data("remote")]);

        let outcomes = collect_outcomes(store.stream(ReadRequest::cached(1, false)), 2).await;
        assert_eq!(outcomes[0], ReadOutcome::loading(ReadOrigin::Fetcher));
        assert_data(&outcomes[1], &"remote".to_string(), ReadOrigin::Fetcher);
        assert_eq!(source_of_truth.current(&1), Some("remote".to_string()));
    }

    #[tokio::test]
    async fn test_stored_value_skips_fetch() {
        let source_of_truth: Arc<InMemorySourceOfTruth<u32, String>> =
            Arc::new(InMemorySourceOfTruth::new());
        source_of_truth.write(&1, "local".to_string()).await.unwrap();
        let (store, fetcher) = with_source_of_truth(source_of_truth);

        let mut events = store.stream(ReadRequest::cached(1, false));
        let outcomes = collect_outcomes(&mut events, 1).await;
        assert_data(&outcomes[0], &"local".to_string(), ReadOrigin::SourceOfTruth);
        assert!(stays_quiet(&mut events).await);
        assert_eq!(fetcher.invocations(), 0);
    }

    #[tokio::test]
    async fn test_fresh_waits_for_fetch_before_reading_source_of_truth() {
        let source_of_truth: Arc<InMemorySourceOfTruth<u32, String>> =
            Arc::new(InMemorySourceOfTruth::new());
        source_of_truth.write(&1, "old".to_string()).await.unwrap();
        let (store, fetcher) = with_source_of_truth(source_of_truth);
        fetcher.script(1, vec![data("new")]);

        let outcomes = collect_outcomes(store.stream(ReadRequest::fresh(1)), 2).await;
        assert_eq!(outcomes[0], ReadOutcome::loading(ReadOrigin::Fetcher));
        assert_data(&outcomes[1], &"new".to_string(), ReadOrigin::Fetcher);
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_stream_open() {
        let (store, fetcher, _cache) = without_source_of_truth();
        fetcher.script(1, vec![FetcherResult::message("offline"), data("later")]);

        let outcomes = collect_outcomes(store.stream(ReadRequest::cached(1, false)), 3).await;
        assert!(outcomes[1].is_error());
        assert_eq!(outcomes[1].origin(), ReadOrigin::Fetcher);
        assert_data(&outcomes[2], &"later".to_string(), ReadOrigin::Fetcher);
    }

    #[tokio::test]
    async fn test_empty_fetch_falls_back_to_cache() {
        let (store, fetcher, cache) = without_source_of_truth();
        cache.put(1, "kept".to_string());
        fetcher.script(1, vec![]);

        // Fresh skips the cache up front but still falls back to it.
        let outcomes = collect_outcomes(store.stream(ReadRequest::fresh(1)), 3).await;
        assert_eq!(outcomes[1], ReadOutcome::no_new_data(ReadOrigin::Fetcher));
        assert_data(&outcomes[2], &"kept".to_string(), ReadOrigin::Cache);
    }

    #[tokio::test]
    async fn test_local_only_without_anything_local() {
        let (store, fetcher, _cache) = without_source_of_truth();

        let outcomes: Vec<_> = store.stream(ReadRequest::local_only(1)).collect().await;
        assert_eq!(outcomes, vec![ReadOutcome::no_new_data(ReadOrigin::Cache)]);
        assert_eq!(fetcher.invocations(), 0);
    }

    #[tokio::test]
    async fn test_local_only_maps_missing_value() {
        let (store, fetcher) = with_source_of_truth(Arc::new(InMemorySourceOfTruth::new()));

        let outcomes = collect_outcomes(store.stream(ReadRequest::local_only(1)), 1).await;
        assert_eq!(
            outcomes,
            vec![ReadOutcome::no_new_data(ReadOrigin::SourceOfTruth)]
        );
        assert_eq!(fetcher.invocations(), 0);
    }

    #[tokio::test]
    async fn test_get_reports_no_data() {
        let (store, fetcher, _cache) = without_source_of_truth();
        fetcher.script(1, vec![]);
        assert!(matches!(store.get(1).await, Err(DepotError::NoData { .. })));

        let (store, fetcher) = with_source_of_truth(Arc::new(InMemorySourceOfTruth::new()));
        fetcher.script(2, vec![]);
        assert!(matches!(store.get(2).await, Err(DepotError::NoData { .. })));
    }

    #[tokio::test]
    async fn test_get_and_fresh_return_values() {
        let (store, fetcher) = with_source_of_truth(Arc::new(InMemorySourceOfTruth::new()));
        fetcher.script(1, vec![data("first")]);
        fetcher.script(1, vec![data("second")]);

        assert_eq!(store.get(1).await.unwrap(), "first");
        assert_eq!(store.get(1).await.unwrap(), "first");
        assert_eq!(store.fresh(1).await.unwrap(), "second");
        assert_eq!(store.fetcher_count(), 0);
        assert_eq!(store.barrier_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_is_returned_by_get() {
        let (store, fetcher, _cache) = without_source_of_truth();
        fetcher.script(1, vec![FetcherResult::message("offline")]);
        assert!(matches!(store.get(1).await, Err(DepotError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_clear_drops_local_copies() {
        let source_of_truth: Arc<InMemorySourceOfTruth<u32, String>> =
            Arc::new(InMemorySourceOfTruth::new());
        let fetcher: Arc<ScriptedFetcher<u32, String>> = Arc::new(ScriptedFetcher::new());
        let cache: Arc<MemoryCache<u32, String>> = Arc::new(MemoryCache::unbounded());
        let store = StoreBuilder::from_fetcher(fetcher.clone() as Arc<dyn Fetcher<u32, String>>)
            .source_of_truth(source_of_truth.clone())
            .cache(cache.clone())
            .build()
            .unwrap();
        fetcher.script(1, vec![data("remote")]);

        assert_eq!(store.get(1).await.unwrap(), "remote");
        assert_eq!(cache.get(&1), Some("remote".to_string()));

        store.clear(&1).await.unwrap();
        assert_eq!(cache.get(&1), None);
        assert_eq!(source_of_truth.current(&1), None);

        store.get(1).await.unwrap();
        store.clear_all().await.unwrap();
        assert!(cache.is_empty());
        assert!(source_of_truth.is_empty());
    }
}
