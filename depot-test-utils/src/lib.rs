//! Depot Test Utilities
//!
//! Shared test infrastructure for the depot workspace:
//! - Scripted collaborators (fetcher, updater, failing source of truth)
//! - Stream helpers with timeouts
//! - Proptest generators for keys, values and read requests
//! - Custom assertions for tagged outcomes

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

// Re-export core types for convenience
pub use depot_core::{
    DepotError, DepotResult, Fetcher, FetcherResult, ReadMode, ReadOrigin, ReadOutcome,
    ReadRequest, SourceOfTruth, SourceOfTruthError, StoreKey, StoreValue, Updater, UpdaterResult,
    UpdaterSuccess, WriteOutcome,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait until `held` is false.
async fn until_released(held: &watch::Sender<bool>) {
    let mut rx = held.subscribe();
    let _ = rx.wait_for(|held| !*held).await.is_ok();
}

// ============================================================================
// SCRIPTED FETCHER
// ============================================================================

/// [`Fetcher`] that replays scripted results.
///
/// Each fetch of a key consumes that key's oldest script; the last script is
/// kept and replayed for every later fetch. Unscripted keys fetch nothing.
/// While held, fetches are started (and counted) but emit nothing.
pub struct ScriptedFetcher<K, V> {
    scripts: Mutex<HashMap<K, VecDeque<Vec<FetcherResult<V>>>>>,
    invocations: Mutex<HashMap<K, usize>>,
    total: AtomicUsize,
    held: watch::Sender<bool>,
}

impl<K: StoreKey, V: StoreValue> ScriptedFetcher<K, V> {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            held: watch::channel(false).0,
        }
    }

    /// Queue the results of one fetch of `key`.
    pub fn script(&self, key: K, results: Vec<FetcherResult<V>>) {
        lock(&self.scripts).entry(key).or_default().push_back(results);
    }

    /// Hold every fetch until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Total fetches started.
    pub fn invocations(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Fetches started for `key`.
    pub fn invocations_for(&self, key: &K) -> usize {
        lock(&self.invocations).get(key).copied().unwrap_or(0)
    }
}

impl<K: StoreKey, V: StoreValue> Default for ScriptedFetcher<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoreKey, V: StoreValue> Fetcher<K, V> for ScriptedFetcher<K, V> {
    fn fetch(&self, key: &K) -> BoxStream<'static, FetcherResult<V>> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *lock(&self.invocations).entry(key.clone()).or_insert(0) += 1;

        let results = match lock(&self.scripts).get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Vec::new(),
        };
        let mut held = self.held.subscribe();
        stream! {
            let _ = held.wait_for(|held| !*held).await.is_ok();
            for result in results {
                yield result;
            }
        }
        .boxed()
    }
}

// ============================================================================
// RECORDING UPDATER
// ============================================================================

/// [`Updater`] that records every post and answers from a script.
///
/// Scripted results are used first, in order; after that every post gets
/// the default result.
pub struct RecordingUpdater<K, V, R> {
    posts: Mutex<Vec<(K, V)>>,
    scripted: Mutex<VecDeque<UpdaterResult<R>>>,
    default: Mutex<UpdaterResult<R>>,
    completions: AtomicUsize,
    held: watch::Sender<bool>,
}

impl<K: StoreKey, V: StoreValue, R: Clone + Send + Sync + 'static> RecordingUpdater<K, V, R> {
    pub fn new(default: UpdaterResult<R>) -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            default: Mutex::new(default),
            completions: AtomicUsize::new(0),
            held: watch::channel(false).0,
        }
    }

    /// Every post succeeds with `response`.
    pub fn succeeding(response: R) -> Self {
        Self::new(UpdaterResult::typed(response))
    }

    /// Every post is rejected with `message`.
    pub fn failing(message: &str) -> Self {
        Self::new(UpdaterResult::message(message))
    }

    /// Answer the next unscripted post with `result`.
    pub fn push_result(&self, result: UpdaterResult<R>) {
        lock(&self.scripted).push_back(result);
    }

    pub fn set_default(&self, result: UpdaterResult<R>) {
        *lock(&self.default) = result;
    }

    /// Hold every post until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn posts(&self) -> Vec<(K, V)> {
        lock(&self.posts).clone()
    }

    pub fn post_count(&self) -> usize {
        lock(&self.posts).len()
    }

    /// Values posted, in order.
    pub fn posted_values(&self) -> Vec<V> {
        lock(&self.posts).iter().map(|(_, value)| value.clone()).collect()
    }

    /// Times the completion hook ran.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K, V, R> Updater<K, V, R> for RecordingUpdater<K, V, R>
where
    K: StoreKey,
    V: StoreValue,
    R: Clone + Send + Sync + 'static,
{
    async fn post(&self, key: &K, value: V) -> UpdaterResult<R> {
        lock(&self.posts).push((key.clone(), value));
        until_released(&self.held).await;
        let scripted = lock(&self.scripted).pop_front();
        match scripted {
            Some(result) => result,
            None => lock(&self.default).clone(),
        }
    }

    fn on_completion(&self, _result: &UpdaterResult<R>) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// FAILING SOURCE OF TRUTH
// ============================================================================

/// [`SourceOfTruth`] whose reads and writes can be made to fail.
///
/// A failing reader emits one `ReadFailed` error and ends. Failing writes
/// leave the stored value untouched.
pub struct FailingSourceOfTruth<K, V> {
    cells: Mutex<HashMap<K, watch::Sender<Option<V>>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_attempts: AtomicUsize,
    held: watch::Sender<bool>,
}

impl<K: StoreKey, V: StoreValue> FailingSourceOfTruth<K, V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
            held: watch::channel(false).0,
        }
    }

    fn with_cell<T>(&self, key: &K, f: impl FnOnce(&watch::Sender<Option<V>>) -> T) -> T {
        let mut cells = lock(&self.cells);
        let cell = cells
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0);
        f(cell)
    }

    /// Store `value` directly, bypassing failure injection.
    pub fn seed(&self, key: K, value: V) {
        self.with_cell(&key, |cell| cell.send_replace(Some(value)));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Hold every write after it is counted, until
    /// [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.held.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.held.send_replace(false);
    }

    pub fn current(&self, key: &K) -> Option<V> {
        lock(&self.cells).get(key).and_then(|cell| cell.borrow().clone())
    }

    /// Writes attempted, failed or not.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

impl<K: StoreKey, V: StoreValue> Default for FailingSourceOfTruth<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: StoreKey, V: StoreValue> SourceOfTruth<K, V> for FailingSourceOfTruth<K, V> {
    fn reader(&self, key: &K) -> BoxStream<'static, DepotResult<Option<V>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            let error = DepotError::from(SourceOfTruthError::ReadFailed {
                key: depot_core::key_label(key),
                reason: "injected read failure".to_string(),
            });
            return stream::iter(vec![Err(error)]).boxed();
        }
        WatchStream::new(self.with_cell(key, watch::Sender::subscribe))
            .map(Ok)
            .boxed()
    }

    async fn write(&self, key: &K, value: V) -> DepotResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        until_released(&self.held).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SourceOfTruthError::WriteFailed {
                key: depot_core::key_label(key),
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        self.with_cell(key, |cell| cell.send_replace(Some(value)));
        Ok(())
    }

    async fn delete(&self, key: &K) -> DepotResult<()> {
        if let Some(cell) = lock(&self.cells).get(key) {
            cell.send_replace(None);
        }
        Ok(())
    }

    async fn delete_all(&self) -> DepotResult<()> {
        for cell in lock(&self.cells).values() {
            cell.send_replace(None);
        }
        Ok(())
    }
}

// ============================================================================
// STREAM HELPERS
// ============================================================================

/// Upper bound on how long a test waits for one stream item.
pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Take the next `count` items from `stream`.
///
/// Panics if the stream ends early or an item takes longer than
/// [`COLLECT_TIMEOUT`].
pub async fn collect_outcomes<S>(mut stream: S, count: usize) -> Vec<S::Item>
where
    S: Stream + Unpin,
{
    let mut items = Vec::with_capacity(count);
    while items.len() < count {
        match tokio::time::timeout(COLLECT_TIMEOUT, stream.next()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => panic!("stream ended after {} of {} items", items.len(), count),
            Err(_) => panic!("timed out after {} of {} items", items.len(), count),
        }
    }
    items
}

/// Take items until the first `Data` and return its value and origin.
pub async fn first_data<S, V>(mut stream: S) -> (V, ReadOrigin)
where
    S: Stream<Item = ReadOutcome<V>> + Unpin,
{
    loop {
        match tokio::time::timeout(COLLECT_TIMEOUT, stream.next()).await {
            Ok(Some(ReadOutcome::Data { value, origin })) => return (value, origin),
            Ok(Some(_)) => continue,
            Ok(None) => panic!("stream ended without data"),
            Err(_) => panic!("timed out waiting for data"),
        }
    }
}

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for depot requests and payloads.

    use super::*;
    use proptest::prelude::*;

    /// A small key space, so generated operations collide.
    pub fn arb_key() -> impl Strategy<Value = u32> {
        0u32..6
    }

    pub fn arb_value() -> impl Strategy<Value = String> {
        "[a-z]{1,8}"
    }

    pub fn arb_read_mode() -> impl Strategy<Value = ReadMode> {
        prop_oneof![
            any::<bool>().prop_map(|refresh| ReadMode::Cached { refresh }),
            Just(ReadMode::Fresh),
            any::<bool>().prop_map(|refresh| ReadMode::SkipCache { refresh }),
            Just(ReadMode::LocalOnly),
        ]
    }

    pub fn arb_read_request() -> impl Strategy<Value = ReadRequest<u32>> {
        (arb_key(), arb_read_mode()).prop_map(|(key, mode)| ReadRequest::new(key, mode))
    }

    /// Values written to one key, oldest first.
    pub fn arb_write_values(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(arb_value(), 1..=max.max(1))
    }

    /// Fetch scripts of up to three results, each data or an error.
    pub fn arb_fetch_script() -> impl Strategy<Value = Vec<FetcherResult<String>>> {
        prop::collection::vec(
            prop_oneof![
                3 => arb_value().prop_map(FetcherResult::Data),
                1 => "[a-z ]{1,12}".prop_map(|message: String| FetcherResult::message(message)),
            ],
            0..=3,
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over tagged outcomes.

    use super::*;
    use std::fmt::Debug;

    /// Assert that `outcome` is `Data(expected, origin)`.
    #[track_caller]
    pub fn assert_data<V: PartialEq + Debug>(
        outcome: &ReadOutcome<V>,
        expected: &V,
        origin: ReadOrigin,
    ) {
        match outcome {
            ReadOutcome::Data {
                value,
                origin: actual,
            } => {
                assert_eq!(value, expected, "Wrong value");
                assert_eq!(*actual, origin, "Wrong origin for {:?}", value);
            }
            other => panic!("Expected Data from {}, got: {:?}", origin, other),
        }
    }

    /// Assert that `outcome` is an error tagged `origin`.
    #[track_caller]
    pub fn assert_error_from<V: Debug>(outcome: &ReadOutcome<V>, origin: ReadOrigin) {
        match outcome {
            ReadOutcome::Error { origin: actual, .. } => {
                assert_eq!(*actual, origin, "Wrong origin for error");
            }
            other => panic!("Expected Error from {}, got: {:?}", origin, other),
        }
    }

    /// Assert that no outcome in `outcomes` is a fetch in progress.
    #[track_caller]
    pub fn assert_no_loading<V: Debug>(outcomes: &[ReadOutcome<V>]) {
        if let Some(loading) = outcomes.iter().find(|outcome| outcome.is_loading()) {
            panic!("Unexpected {:?} in {:?}", loading, outcomes);
        }
    }

    #[track_caller]
    pub fn assert_write_success<R: Debug>(outcome: &WriteOutcome<R>) {
        assert!(outcome.is_success(), "Expected write success, got: {:?}", outcome);
    }

    #[track_caller]
    pub fn assert_write_error<R: Debug>(outcome: &WriteOutcome<R>) {
        assert!(outcome.is_error(), "Expected write error, got: {:?}", outcome);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_fetcher_replays_last_script() {
        let fetcher: ScriptedFetcher<u32, String> = ScriptedFetcher::new();
        fetcher.script(1, vec![FetcherResult::Data("a".to_string())]);
        fetcher.script(1, vec![FetcherResult::Data("b".to_string())]);

        let first: Vec<_> = fetcher.fetch(&1).collect().await;
        let second: Vec<_> = fetcher.fetch(&1).collect().await;
        let third: Vec<_> = fetcher.fetch(&1).collect().await;
        assert_eq!(first, vec![FetcherResult::Data("a".to_string())]);
        assert_eq!(second, vec![FetcherResult::Data("b".to_string())]);
        assert_eq!(third, second);

        assert!(fetcher.fetch(&2).collect::<Vec<_>>().await.is_empty());
        assert_eq!(fetcher.invocations(), 4);
        assert_eq!(fetcher.invocations_for(&1), 3);
    }

    #[tokio::test]
    async fn test_held_fetch_emits_after_release() {
        let fetcher: ScriptedFetcher<u32, String> = ScriptedFetcher::new();
        fetcher.script(1, vec![FetcherResult::Data("a".to_string())]);
        fetcher.hold();

        let mut fetch = fetcher.fetch(&1);
        let held = tokio::time::timeout(Duration::from_millis(20), fetch.next()).await;
        assert!(held.is_err());

        fetcher.release();
        assert_eq!(fetch.next().await, Some(FetcherResult::Data("a".to_string())));
    }

    #[tokio::test]
    async fn test_recording_updater_uses_script_then_default() {
        let updater: RecordingUpdater<u32, String, u32> = RecordingUpdater::succeeding(200);
        updater.push_result(UpdaterResult::message("busy"));

        assert!(!updater.post(&1, "a".to_string()).await.is_success());
        assert_eq!(
            updater.post(&1, "b".to_string()).await,
            UpdaterResult::typed(200)
        );
        assert_eq!(updater.posted_values(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_source_of_truth_keeps_value_on_failed_write() {
        let store: FailingSourceOfTruth<u32, String> = FailingSourceOfTruth::new();
        store.seed(1, "good".to_string());
        store.fail_writes(true);

        assert!(store.write(&1, "bad".to_string()).await.is_err());
        assert_eq!(store.current(&1), Some("good".to_string()));
        assert_eq!(store.write_attempts(), 1);

        store.fail_reads(true);
        let reads = collect_outcomes(store.reader(&1), 1).await;
        assert!(matches!(
            &reads[0],
            Err(DepotError::SourceOfTruth(SourceOfTruthError::ReadFailed { .. }))
        ));
    }
}
