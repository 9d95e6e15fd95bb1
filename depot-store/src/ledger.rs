//! Per-key ledger of writes not yet acknowledged by the remote origin.
//!
//! Entries are kept ordered by `created_at`. Resolution always removes a
//! prefix of that order, so an acknowledgement can never resolve a newer
//! write ahead of an older one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use depot_core::{
    StoreKey, StoreValue, Timestamp, UpdaterSuccess, WriteCompletion, WriteOutcome, WriteRequest,
};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::ref_counted::{Lease, RefCountedResource};

struct LedgerEntry<V, R> {
    id: Uuid,
    value: V,
    created_at: Timestamp,
    completions: Vec<WriteCompletion<R>>,
    resolved: oneshot::Sender<WriteOutcome<R>>,
}

/// Handle on a queued write, used to learn whether another post already
/// resolved it.
pub struct PendingWrite<R> {
    pub id: Uuid,
    pub created_at: Timestamp,
    resolved: oneshot::Receiver<WriteOutcome<R>>,
}

impl<R> PendingWrite<R> {
    /// The outcome, if the write has been resolved.
    pub fn try_resolved(&mut self) -> Option<WriteOutcome<R>> {
        self.resolved.try_recv().ok()
    }
}

/// Held while posting for a key. Posts for one key never overlap.
pub struct PostGuard<K: StoreKey> {
    _guard: OwnedMutexGuard<()>,
    _lock: Lease<K, AsyncMutex<()>>,
}

/// Ordered queues of unacknowledged writes, one per key.
pub struct WriteRequestLedger<K: StoreKey, V, R> {
    queues: Mutex<HashMap<K, VecDeque<LedgerEntry<V, R>>>>,
    post_locks: Arc<RefCountedResource<K, AsyncMutex<()>>>,
}

impl<K, V, R> WriteRequestLedger<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            post_locks: Arc::new(RefCountedResource::new(|_key: &K| AsyncMutex::new(()))),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<K, VecDeque<LedgerEntry<V, R>>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `request` in `created_at` order. Entries with equal timestamps
    /// keep their arrival order.
    pub fn push(&self, request: WriteRequest<K, V, R>) -> PendingWrite<R> {
        let (resolved_tx, resolved_rx) = oneshot::channel();
        let WriteRequest {
            id,
            key,
            value,
            created_at,
            completions,
        } = request;

        let mut queues = self.queues();
        let queue = queues.entry(key).or_default();
        let position = queue
            .iter()
            .rposition(|entry| entry.created_at <= created_at)
            .map_or(0, |index| index + 1);
        queue.insert(
            position,
            LedgerEntry {
                id,
                value,
                created_at,
                completions,
                resolved: resolved_tx,
            },
        );

        PendingWrite {
            id,
            created_at,
            resolved: resolved_rx,
        }
    }

    /// The most recent queued value for `key` and its timestamp.
    pub fn latest(&self, key: &K) -> Option<(V, Timestamp)> {
        self.queues()
            .get(key)
            .and_then(|queue| queue.back())
            .map(|entry| (entry.value.clone(), entry.created_at))
    }

    /// Resolve every entry for `key` created at or before `through`.
    ///
    /// Completion callbacks run in ledger order, outside the ledger lock.
    /// Returns how many entries were resolved.
    pub fn resolve_through(
        &self,
        key: &K,
        through: Timestamp,
        success: &UpdaterSuccess<R>,
    ) -> usize {
        let resolved: Vec<LedgerEntry<V, R>> = {
            let mut queues = self.queues();
            let Some(queue) = queues.get_mut(key) else {
                return 0;
            };
            let count = queue
                .iter()
                .take_while(|entry| entry.created_at <= through)
                .count();
            let resolved = queue.drain(..count).collect();
            if queue.is_empty() {
                queues.remove(key);
            }
            resolved
        };

        let count = resolved.len();
        for entry in resolved {
            let outcome = WriteOutcome::Success(success.clone());
            for completion in entry.completions {
                completion(&outcome);
            }
            // The writer may have stopped waiting.
            let _ = entry.resolved.send(outcome);
        }
        count
    }

    /// Whether `id` is still queued for `key`.
    pub fn contains(&self, key: &K, id: Uuid) -> bool {
        self.queues()
            .get(key)
            .is_some_and(|queue| queue.iter().any(|entry| entry.id == id))
    }

    pub fn len(&self, key: &K) -> usize {
        self.queues().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &K) -> bool {
        self.len(key) == 0
    }

    /// Serialise posts for `key`.
    pub async fn lock_posts(&self, key: &K) -> PostGuard<K> {
        let lock = self.post_locks.acquire(key);
        let guard = Arc::clone(lock.shared()).lock_owned().await;
        PostGuard {
            _guard: guard,
            _lock: lock,
        }
    }
}

impl<K, V, R> Default for WriteRequestLedger<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Mutex as StdMutex;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + Duration::seconds(seconds)
    }

    fn request(value: &'static str, created: i64) -> WriteRequest<u32, &'static str, u32> {
        WriteRequest::new(1, value).with_created_at(at(created))
    }

    #[test]
    fn test_push_orders_by_created_at() {
        let ledger = WriteRequestLedger::new();
        ledger.push(request("b", 2));
        ledger.push(request("c", 3));
        ledger.push(request("a", 1));

        assert_eq!(ledger.len(&1), 3);
        assert_eq!(ledger.latest(&1), Some(("c", at(3))));
    }

    #[test]
    fn test_resolve_removes_prefix_only() {
        let ledger = WriteRequestLedger::new();
        let mut first = ledger.push(request("a", 1));
        let mut second = ledger.push(request("b", 2));
        let mut third = ledger.push(request("c", 3));

        let resolved = ledger.resolve_through(&1, at(2), &UpdaterSuccess::Typed(200));
        assert_eq!(resolved, 2);
        assert_eq!(ledger.len(&1), 1);
        assert_eq!(first.try_resolved(), Some(WriteOutcome::Success(UpdaterSuccess::Typed(200))));
        assert!(second.try_resolved().is_some());
        assert!(third.try_resolved().is_none());
        assert!(ledger.contains(&1, third.id));
        assert!(!ledger.contains(&1, first.id));
    }

    #[test]
    fn test_completions_fire_in_ledger_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let ledger = WriteRequestLedger::new();
        for (value, created) in [("w2", 2), ("w1", 1)] {
            let order = Arc::clone(&order);
            ledger.push(request(value, created).on_complete(move |outcome| {
                assert!(outcome.is_success());
                order.lock().unwrap().push(value);
            }));
        }

        ledger.resolve_through(&1, at(5), &UpdaterSuccess::Typed(1));
        assert_eq!(*order.lock().unwrap(), vec!["w1", "w2"]);
        assert!(ledger.is_empty(&1));
    }

    #[test]
    fn test_resolve_unknown_key_is_noop() {
        let ledger: WriteRequestLedger<u32, &str, u32> = WriteRequestLedger::new();
        assert_eq!(
            ledger.resolve_through(&7, at(1), &UpdaterSuccess::Typed(0)),
            0
        );
    }

    #[tokio::test]
    async fn test_post_lock_serialises_per_key() {
        let ledger: Arc<WriteRequestLedger<u32, &str, u32>> = Arc::new(WriteRequestLedger::new());
        let guard = ledger.lock_posts(&1).await;

        let contender = Arc::clone(&ledger);
        let waiting = tokio::spawn(async move {
            let _guard = contender.lock_posts(&1).await;
        });
        // Other keys are not blocked.
        let _other = ledger.lock_posts(&2).await;

        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        drop(guard);
        waiting.await.unwrap();
    }
}
