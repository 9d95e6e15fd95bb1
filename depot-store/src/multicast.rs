//! Shared remote fetches.
//!
//! The [`FetcherMulticaster`] keeps at most one fetch running per key and
//! fans its results out to every subscriber over a broadcast channel.
//! Subscribers stay attached after a fetch completes, so values fetched for
//! later readers still reach earlier ones.

use std::sync::{Arc, Mutex, MutexGuard};

use async_stream::stream;
use depot_core::{
    Fetcher, FetcherResult, ReadOrigin, ReadOutcome, StoreKey, StoreValue,
    DEFAULT_FETCH_BUFFER_CAPACITY,
};
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::barrier::SourceOfTruthBarrier;
use crate::ref_counted::{Lease, RefCountedResource};

#[derive(Default)]
struct RunState {
    active: bool,
    /// The current run has sent at least one event.
    dispatched: bool,
    /// A subscriber arrived too late for the current run.
    rerun: bool,
    task: Option<JoinHandle<()>>,
}

/// One key's shared fetch.
pub(crate) struct Multicast<V> {
    events: broadcast::Sender<ReadOutcome<V>>,
    run: Mutex<RunState>,
}

impl<V: StoreValue> Multicast<V> {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            run: Mutex::new(RunState::default()),
        }
    }

    fn run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, outcome: ReadOutcome<V>) {
        self.run().dispatched = true;
        // No receivers is fine; the run keeps going for late subscribers.
        let _ = self.events.send(outcome);
    }

    fn stop(&self) {
        if let Some(task) = self.run().task.take() {
            task.abort();
        }
    }
}

/// Ensures one fetch per key and shares its results.
pub struct FetcherMulticaster<K: StoreKey, V: StoreValue> {
    fetcher: Arc<dyn Fetcher<K, V>>,
    barrier: Option<Arc<SourceOfTruthBarrier<K, V>>>,
    multicasts: Arc<RefCountedResource<K, Multicast<V>>>,
}

impl<K: StoreKey, V: StoreValue> FetcherMulticaster<K, V> {
    pub fn new(
        fetcher: Arc<dyn Fetcher<K, V>>,
        barrier: Option<Arc<SourceOfTruthBarrier<K, V>>>,
    ) -> Self {
        Self::with_capacity(fetcher, barrier, DEFAULT_FETCH_BUFFER_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it
    /// starts missing events.
    pub fn with_capacity(
        fetcher: Arc<dyn Fetcher<K, V>>,
        barrier: Option<Arc<SourceOfTruthBarrier<K, V>>>,
        capacity: usize,
    ) -> Self {
        let multicasts = RefCountedResource::with_release(
            move |_key: &K| Multicast::new(capacity),
            |key: &K, multicast: &Arc<Multicast<V>>| {
                debug!(key = ?key, "Releasing shared fetch");
                multicast.stop();
            },
        );
        Self {
            fetcher,
            barrier,
            multicasts: Arc::new(multicasts),
        }
    }

    /// Attach to the shared fetch for `key`.
    ///
    /// Unless `piggyback_only` is set, this starts a fetch when none is
    /// running. A piggyback-only subscriber just listens for fetches started
    /// by others. The subscription holds the shared fetch alive until it is
    /// dropped.
    pub fn subscribe(&self, key: &K, piggyback_only: bool) -> BoxStream<'static, ReadOutcome<V>> {
        let multicast = self.multicasts.acquire(key);
        let rx = multicast.events.subscribe();
        if !piggyback_only {
            self.activate(&multicast);
        }

        let mut events = BroadcastStream::new(rx);
        let key = key.clone();
        stream! {
            let _multicast = multicast;
            while let Some(event) = events.next().await {
                match event {
                    Ok(outcome) => yield outcome,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(key = ?key, skipped, "Fetch subscriber lagged");
                    }
                }
            }
        }
        .boxed()
    }

    fn activate(&self, multicast: &Lease<K, Multicast<V>>) {
        let mut run = multicast.run();
        if !run.active {
            run.active = true;
            run.dispatched = false;
            run.rerun = false;
            run.task = Some(tokio::spawn(produce(
                multicast.key().clone(),
                Arc::clone(&self.fetcher),
                self.barrier.clone(),
                Arc::clone(multicast.shared()),
            )));
        } else if run.dispatched {
            run.rerun = true;
        }
    }

    /// Number of keys with a live shared fetch.
    pub fn fetcher_count(&self) -> usize {
        self.multicasts.size()
    }
}

async fn produce<K: StoreKey, V: StoreValue>(
    key: K,
    fetcher: Arc<dyn Fetcher<K, V>>,
    barrier: Option<Arc<SourceOfTruthBarrier<K, V>>>,
    multicast: Arc<Multicast<V>>,
) {
    loop {
        debug!(key = ?key, "Fetch started");
        let mut results = fetcher.fetch(&key);
        let mut emitted = 0usize;

        while let Some(result) = results.next().await {
            if let (FetcherResult::Data(value), Some(barrier)) = (&result, &barrier) {
                if let Err(error) = barrier.write(&key, value.clone()).await {
                    warn!(key = ?key, error = %error, "Fetched value not persisted");
                }
            }
            multicast.dispatch(result.into_outcome());
            emitted += 1;
        }
        if emitted == 0 {
            multicast.dispatch(ReadOutcome::no_new_data(ReadOrigin::Fetcher));
        }
        debug!(key = ?key, emitted, "Fetch finished");

        let rerun = {
            let mut run = multicast.run();
            run.dispatched = false;
            if run.rerun {
                run.rerun = false;
            } else {
                run.active = false;
            }
            run.active
        };
        if !rerun {
            break;
        }
        debug!(key = ?key, "Fetch restarted for late subscribers");
    }
}
