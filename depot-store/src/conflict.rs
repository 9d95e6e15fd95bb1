//! Posting queued writes and resolving conflicts.

use std::sync::Arc;

use chrono::Utc;
use depot_core::{
    key_label, Bookkeeper, DepotError, StoreKey, StoreValue, Timestamp, UpdateError, Updater,
    UpdaterResult, UpdaterSuccess, WriteOutcome,
};
use tracing::{debug, info, warn};

use crate::ledger::{PendingWrite, WriteRequestLedger};
use crate::store::Store;

/// Result of trying to sync a key's local state before a read.
#[derive(Debug, Clone, PartialEq)]
pub enum EagerResolution<R> {
    /// Nothing was waiting to be synced.
    NoConflicts,
    /// The latest local value was posted and acknowledged.
    ConflictsResolved(UpdaterSuccess<R>),
    /// The post failed; queued writes stay queued.
    Failed(UpdateError),
}

impl<R> EagerResolution<R> {
    pub fn is_failed(&self) -> bool {
        matches!(self, EagerResolution::Failed(_))
    }
}

/// Posts ledger entries to the remote origin and records the results.
pub struct ConflictResolver<K: StoreKey, V: StoreValue, R> {
    store: Store<K, V>,
    ledger: Arc<WriteRequestLedger<K, V, R>>,
    updater: Arc<dyn Updater<K, V, R>>,
    bookkeeper: Arc<dyn Bookkeeper<K>>,
}

impl<K, V, R> ConflictResolver<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Store<K, V>,
        ledger: Arc<WriteRequestLedger<K, V, R>>,
        updater: Arc<dyn Updater<K, V, R>>,
        bookkeeper: Arc<dyn Bookkeeper<K>>,
    ) -> Self {
        Self {
            store,
            ledger,
            updater,
            bookkeeper,
        }
    }

    async fn conflicts_might_exist(&self, key: &K) -> bool {
        if !self.ledger.is_empty(key) {
            return true;
        }
        match self.bookkeeper.get_last_failed_sync(key).await {
            Ok(last_failed) => last_failed.is_some(),
            Err(error) => {
                warn!(key = ?key, error = %error, "Bookkeeper lookup failed");
                false
            }
        }
    }

    /// Post the latest local value for `key` if it may be out of sync with
    /// the remote origin.
    ///
    /// The newest queued write wins over the stored value, and only queued
    /// writes up to the one posted are resolved. A stored value posted with
    /// nothing queued resolves nothing. On success the key's failed-sync
    /// record is cleared; on failure a new record is written.
    pub async fn eagerly_resolve_conflicts(&self, key: &K) -> EagerResolution<R> {
        if !self.conflicts_might_exist(key).await {
            return EagerResolution::NoConflicts;
        }

        let _posting = self.ledger.lock_posts(key).await;
        let (latest, through) = match self.ledger.latest(key) {
            Some((value, created_at)) => (value, Some(created_at)),
            None => match self.store.latest_or_none(key).await {
                Some(value) => (value, None),
                None => return EagerResolution::NoConflicts,
            },
        };

        let result = self.updater.post(key, latest).await;
        match &result {
            UpdaterResult::Success(success) => {
                self.record_success(key, through, success, &result).await;
                EagerResolution::ConflictsResolved(success.clone())
            }
            UpdaterResult::Error(error) => {
                self.record_failure(key, &result).await;
                EagerResolution::Failed(error.clone())
            }
        }
    }

    /// Post the newest queued value for the key of `pending`.
    ///
    /// Posts for one key are serialised. When an earlier post already
    /// covered `pending`, its outcome is returned without posting again.
    pub async fn post_latest(&self, key: &K, mut pending: PendingWrite<R>) -> WriteOutcome<R> {
        let _posting = self.ledger.lock_posts(key).await;
        if let Some(outcome) = pending.try_resolved() {
            debug!(key = ?key, write_id = %pending.id, "Write resolved by a newer post");
            return outcome;
        }
        let Some((latest, through)) = self.ledger.latest(key) else {
            return WriteOutcome::Error(DepotError::NoData {
                key: key_label(key),
            });
        };

        let result = self.updater.post(key, latest).await;
        match &result {
            UpdaterResult::Success(success) => {
                self.record_success(key, Some(through), success, &result).await;
            }
            UpdaterResult::Error(_) => {
                self.record_failure(key, &result).await;
            }
        }
        WriteOutcome::from(result)
    }

    async fn record_success(
        &self,
        key: &K,
        through: Option<Timestamp>,
        success: &UpdaterSuccess<R>,
        result: &UpdaterResult<R>,
    ) {
        let resolved = through.map_or(0, |through| {
            self.ledger.resolve_through(key, through, success)
        });
        for _ in 0..resolved {
            self.updater.on_completion(result);
        }
        debug!(key = ?key, resolved, "Writes acknowledged");
        if let Err(error) = self.bookkeeper.clear(key).await {
            warn!(key = ?key, error = %error, "Failed to clear sync failure");
        }
    }

    async fn record_failure(&self, key: &K, result: &UpdaterResult<R>) {
        self.updater.on_completion(result);
        self.mark_unsynced(key).await;
    }

    /// Record that `key` has local state the remote origin has not seen.
    pub async fn mark_unsynced(&self, key: &K) {
        match self.bookkeeper.set_last_failed_sync(key, Utc::now()).await {
            Ok(()) => info!(key = ?key, pending = self.ledger.len(key), "Sync failure recorded"),
            Err(error) => warn!(key = ?key, error = %error, "Failed to record sync failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StoreBuilder;
    use crate::memory::{InMemoryBookkeeper, InMemorySourceOfTruth};
    use depot_core::{Fetcher, SourceOfTruth, WriteRequest};
    use depot_test_utils::{RecordingUpdater, ScriptedFetcher};

    struct Fixture {
        resolver: ConflictResolver<u32, String, u32>,
        ledger: Arc<WriteRequestLedger<u32, String, u32>>,
        source_of_truth: Arc<InMemorySourceOfTruth<u32, String>>,
        updater: Arc<RecordingUpdater<u32, String, u32>>,
        bookkeeper: Arc<InMemoryBookkeeper<u32>>,
    }

    fn fixture(updater: RecordingUpdater<u32, String, u32>) -> Fixture {
        let fetcher: Arc<ScriptedFetcher<u32, String>> = Arc::new(ScriptedFetcher::new());
        let source_of_truth: Arc<InMemorySourceOfTruth<u32, String>> =
            Arc::new(InMemorySourceOfTruth::new());
        let store = StoreBuilder::from_fetcher(fetcher as Arc<dyn Fetcher<u32, String>>)
            .source_of_truth(source_of_truth.clone())
            .build()
            .unwrap();
        let ledger: Arc<WriteRequestLedger<u32, String, u32>> = Arc::new(WriteRequestLedger::new());
        let updater = Arc::new(updater);
        let bookkeeper: Arc<InMemoryBookkeeper<u32>> = Arc::new(InMemoryBookkeeper::new());
        let resolver = ConflictResolver::new(
            store,
            Arc::clone(&ledger),
            updater.clone(),
            bookkeeper.clone(),
        );
        Fixture {
            resolver,
            ledger,
            source_of_truth,
            updater,
            bookkeeper,
        }
    }

    #[tokio::test]
    async fn test_recorded_failure_posts_stored_value() {
        let f = fixture(RecordingUpdater::succeeding(200));
        f.source_of_truth.write(&1, "stored".to_string()).await.unwrap();
        f.bookkeeper.set_last_failed_sync(&1, Utc::now()).await.unwrap();

        let resolution = f.resolver.eagerly_resolve_conflicts(&1).await;
        assert_eq!(
            resolution,
            EagerResolution::ConflictsResolved(UpdaterSuccess::Typed(200))
        );
        assert_eq!(f.updater.posted_values(), vec!["stored".to_string()]);
        assert_eq!(f.bookkeeper.get_last_failed_sync(&1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nothing_local_means_no_conflicts() {
        let f = fixture(RecordingUpdater::succeeding(200));
        f.bookkeeper.set_last_failed_sync(&1, Utc::now()).await.unwrap();

        let resolution = f.resolver.eagerly_resolve_conflicts(&1).await;
        assert_eq!(resolution, EagerResolution::NoConflicts);
        assert_eq!(f.updater.post_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_resolution_records_failure() {
        let f = fixture(RecordingUpdater::failing("offline"));
        f.source_of_truth.write(&1, "stored".to_string()).await.unwrap();
        f.ledger.push(WriteRequest::new(1, "stored".to_string()));

        let resolution = f.resolver.eagerly_resolve_conflicts(&1).await;
        assert!(matches!(
            resolution,
            EagerResolution::Failed(UpdateError::Rejected { .. })
        ));
        assert_eq!(f.ledger.len(&1), 1);
        assert!(f.bookkeeper.get_last_failed_sync(&1).await.unwrap().is_some());
        assert_eq!(f.updater.completions(), 1);
    }

    #[tokio::test]
    async fn test_post_latest_skips_already_resolved_write() {
        let f = fixture(RecordingUpdater::succeeding(200));
        let older = f.ledger.push(WriteRequest::new(1, "older".to_string()));
        let newer = f.ledger.push(WriteRequest::new(1, "newer".to_string()));

        let outcome = f.resolver.post_latest(&1, newer).await;
        assert!(outcome.is_success());
        assert_eq!(f.updater.posted_values(), vec!["newer".to_string()]);

        let outcome = f.resolver.post_latest(&1, older).await;
        assert_eq!(outcome, WriteOutcome::Success(UpdaterSuccess::Typed(200)));
        assert_eq!(f.updater.post_count(), 1);
        assert!(f.ledger.is_empty(&1));
    }
}
