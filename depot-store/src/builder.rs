//! Store construction.

use std::sync::Arc;

use depot_core::{
    Bookkeeper, Cache, DepotResult, Fetcher, MemoryPolicy, SourceOfTruth, StoreConfig, StoreKey,
    StoreValue, Updater,
};
use tracing::debug;

use crate::barrier::SourceOfTruthBarrier;
use crate::conflict::ConflictResolver;
use crate::ledger::WriteRequestLedger;
use crate::memory::MemoryCache;
use crate::multicast::FetcherMulticaster;
use crate::mutable_store::MutableStore;
use crate::store::{Store, StoreInner};

/// Assembles a [`Store`] or [`MutableStore`] from its collaborators.
///
/// Only the fetcher is required. Without a source of truth the store serves
/// fetched values straight from the fetch and the memory cache. Without a
/// cache (and without a memory policy) nothing is kept in memory.
///
/// ```ignore
/// let store = StoreBuilder::from_fetcher(fetcher)
///     .source_of_truth(database)
///     .memory_policy(MemoryPolicy::new().with_max_size(1_000))
///     .build()?;
/// ```
pub struct StoreBuilder<K: StoreKey, V: StoreValue> {
    fetcher: Arc<dyn Fetcher<K, V>>,
    source_of_truth: Option<Arc<dyn SourceOfTruth<K, V>>>,
    cache: Option<Arc<dyn Cache<K, V>>>,
    config: StoreConfig,
}

impl<K: StoreKey, V: StoreValue> StoreBuilder<K, V> {
    pub fn from_fetcher(fetcher: Arc<dyn Fetcher<K, V>>) -> Self {
        Self {
            fetcher,
            source_of_truth: None,
            cache: None,
            config: StoreConfig::default(),
        }
    }

    pub fn source_of_truth(mut self, source_of_truth: Arc<dyn SourceOfTruth<K, V>>) -> Self {
        self.source_of_truth = Some(source_of_truth);
        self
    }

    /// Use a caller-supplied cache. Takes precedence over any memory policy.
    pub fn cache(mut self, cache: Arc<dyn Cache<K, V>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Install a [`MemoryCache`] governed by `policy`.
    pub fn memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.config.memory_policy = Some(policy);
        self
    }

    /// Replace the whole config. A memory policy set earlier is kept when
    /// `config` has none.
    pub fn config(mut self, config: StoreConfig) -> Self {
        let earlier_policy = self.config.memory_policy.take();
        self.config = config;
        if self.config.memory_policy.is_none() {
            self.config.memory_policy = earlier_policy;
        }
        self
    }

    fn inner(self) -> DepotResult<StoreInner<K, V>> {
        self.config.validate()?;

        let cache = match (self.cache, &self.config.memory_policy) {
            (Some(cache), _) => Some(cache),
            (None, Some(policy)) => {
                Some(Arc::new(MemoryCache::new(policy)) as Arc<dyn Cache<K, V>>)
            }
            (None, None) => None,
        };
        let barrier = self
            .source_of_truth
            .map(|source_of_truth| Arc::new(SourceOfTruthBarrier::new(source_of_truth)));
        let multicaster = Arc::new(FetcherMulticaster::with_capacity(
            self.fetcher,
            barrier.clone(),
            self.config.fetch_buffer_capacity,
        ));

        debug!(
            memory_cache = cache.is_some(),
            source_of_truth = barrier.is_some(),
            fetch_buffer_capacity = self.config.fetch_buffer_capacity,
            "Building store"
        );
        Ok(StoreInner {
            cache,
            barrier,
            multicaster,
            config: self.config,
        })
    }

    /// Build a read-only store.
    pub fn build(self) -> DepotResult<Store<K, V>> {
        Ok(Store {
            inner: Arc::new(self.inner()?),
        })
    }

    /// Build a store that also accepts local writes, posting them through
    /// `updater` and recording failed syncs in `bookkeeper`.
    pub fn build_mutable<R>(
        self,
        updater: Arc<dyn Updater<K, V, R>>,
        bookkeeper: Arc<dyn Bookkeeper<K>>,
    ) -> DepotResult<MutableStore<K, V, R>>
    where
        R: Clone + Send + Sync + 'static,
    {
        let store = self.build()?;
        let ledger = Arc::new(WriteRequestLedger::new());
        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            Arc::clone(&ledger),
            updater,
            bookkeeper,
        ));
        Ok(MutableStore::new(store, ledger, resolver))
    }
}
