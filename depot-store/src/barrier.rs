//! Versioned read/write barrier in front of the source of truth.
//!
//! Every key being read or written has a barrier cell holding a
//! [`BarrierState`]. Writes flip the cell to `Blocked`, perform the durable
//! write, then reopen it with a fresh version. Readers stop serving while the
//! cell is blocked and restart their source-of-truth read when it reopens,
//! which lets them tag the first post-write value as coming from the fetcher.
//!
//! Versions come from one counter shared by all keys, so a reader can tell
//! whether a transition happened before or after it subscribed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_stream::stream;
use depot_core::{
    key_label, DepotError, DepotResult, ReadOrigin, ReadOutcome, SourceOfTruth,
    SourceOfTruthError, StoreKey, StoreValue,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::latch::Latch;
use crate::ref_counted::RefCountedResource;

/// State of one key's barrier.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierState {
    /// Reads may proceed. Carries the error of the write that reopened the
    /// barrier, if that write failed.
    Open {
        version: u64,
        write_error: Option<DepotError>,
    },
    /// A durable write is in flight.
    Blocked { version: u64 },
}

impl BarrierState {
    pub fn version(&self) -> u64 {
        match self {
            BarrierState::Open { version, .. } | BarrierState::Blocked { version } => *version,
        }
    }
}

/// Per-key barrier cell.
pub(crate) struct BarrierCell {
    state: watch::Sender<BarrierState>,
    /// Serialises durable writes for the key.
    write_lock: Mutex<()>,
}

impl BarrierCell {
    fn new() -> Self {
        let (state, _) = watch::channel(BarrierState::Open {
            version: 0,
            write_error: None,
        });
        Self {
            state,
            write_lock: Mutex::new(()),
        }
    }
}

enum Step<T> {
    Changed,
    Closed,
    Item(T),
    ReaderDone,
}

/// Wraps a [`SourceOfTruth`] and blocks reads while a write is in progress.
pub struct SourceOfTruthBarrier<K: StoreKey, V: StoreValue> {
    source_of_truth: Arc<dyn SourceOfTruth<K, V>>,
    cells: Arc<RefCountedResource<K, BarrierCell>>,
    versions: Arc<AtomicU64>,
}

impl<K: StoreKey, V: StoreValue> SourceOfTruthBarrier<K, V> {
    pub fn new(source_of_truth: Arc<dyn SourceOfTruth<K, V>>) -> Self {
        Self {
            source_of_truth,
            cells: Arc::new(RefCountedResource::new(|_key: &K| BarrierCell::new())),
            versions: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stream the stored value for `key`.
    ///
    /// The reader's version is taken when this is called, not when the
    /// stream is first polled. Nothing is emitted until `gate` opens.
    ///
    /// The first value read after a barrier transition newer than the
    /// reader is tagged [`ReadOrigin::Fetcher`] when the transition carries
    /// no error; every other value is tagged [`ReadOrigin::SourceOfTruth`].
    /// A write error carried by such a transition is emitted first.
    pub fn reader(&self, key: K, gate: Latch) -> BoxStream<'static, ReadOutcome<Option<V>>> {
        let cell = self.cells.acquire(&key);
        let reader_version = self.next_version();
        let mut state_rx = cell.state.subscribe();
        let source_of_truth = Arc::clone(&self.source_of_truth);

        stream! {
            let _cell = cell;
            gate.wait().await;

            loop {
                let state = state_rx.borrow_and_update().clone();
                let arrived_after_me = reader_version < state.version();

                let mut reads: BoxStream<'static, DepotResult<Option<V>>> = match &state {
                    BarrierState::Open { write_error, .. } => {
                        if arrived_after_me {
                            if let Some(error) = write_error.clone() {
                                yield ReadOutcome::error(error, ReadOrigin::SourceOfTruth);
                            }
                        }
                        source_of_truth.reader(&key)
                    }
                    BarrierState::Blocked { .. } => stream::empty().boxed(),
                };
                let first_origin = match &state {
                    BarrierState::Open { write_error: None, .. } if arrived_after_me => {
                        ReadOrigin::Fetcher
                    }
                    _ => ReadOrigin::SourceOfTruth,
                };

                let mut index = 0usize;
                let mut reader_done = false;
                loop {
                    let step = tokio::select! {
                        biased;
                        changed = state_rx.changed() => match changed {
                            Ok(()) => Step::Changed,
                            Err(_) => Step::Closed,
                        },
                        read = reads.next(), if !reader_done => match read {
                            Some(read) => Step::Item(read),
                            None => Step::ReaderDone,
                        },
                    };

                    match step {
                        Step::Changed => break,
                        Step::Closed => return,
                        Step::ReaderDone => reader_done = true,
                        Step::Item(read) => {
                            // A value observed after the barrier moved on belongs to
                            // the next state.
                            if state_rx.has_changed().unwrap_or(false) {
                                break;
                            }
                            match read {
                                Ok(value) => {
                                    let origin = if index == 0 {
                                        first_origin
                                    } else {
                                        ReadOrigin::SourceOfTruth
                                    };
                                    index += 1;
                                    yield ReadOutcome::data(value, origin);
                                }
                                Err(error) => {
                                    yield ReadOutcome::error(
                                        read_failure(&key, error),
                                        ReadOrigin::SourceOfTruth,
                                    );
                                    reader_done = true;
                                }
                            }
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Write `value` through the barrier.
    ///
    /// Blocks readers of `key`, writes, then reopens them. A failed durable
    /// write is not returned; it is carried by the reopened state and
    /// delivered to readers. The write runs in its own task, so dropping the
    /// returned future does not leave the barrier blocked.
    pub async fn write(&self, key: &K, value: V) -> DepotResult<()> {
        self.write_capturing(key, value).await.map(|_| ())
    }

    /// [`write`](Self::write), also handing back the durable write error
    /// that readers will be given.
    pub(crate) async fn write_capturing(
        &self,
        key: &K,
        value: V,
    ) -> DepotResult<Option<DepotError>> {
        let cell = self.cells.acquire(key);
        let source_of_truth = Arc::clone(&self.source_of_truth);
        let versions = Arc::clone(&self.versions);
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let _serialised = cell.write_lock.lock().await;
            let next = || versions.fetch_add(1, Ordering::SeqCst) + 1;

            cell.state.send_replace(BarrierState::Blocked { version: next() });
            let write_error = match source_of_truth.write(&task_key, value).await {
                Ok(()) => None,
                Err(error) => {
                    warn!(key = ?task_key, error = %error, "Source of truth write failed");
                    Some(write_failure(&task_key, error))
                }
            };
            cell.state.send_replace(BarrierState::Open {
                version: next(),
                write_error: write_error.clone(),
            });
            debug!(key = ?task_key, "Barrier reopened");
            write_error
        });

        task.await.map_err(|join_error| {
            error!(key = ?key, error = %join_error, "Barrier write task aborted");
            DepotError::Cancelled {
                key: key_label(key),
            }
        })
    }

    /// Pass-through delete; not coordinated with readers.
    pub async fn delete(&self, key: &K) -> DepotResult<()> {
        self.source_of_truth.delete(key).await
    }

    /// Pass-through delete of every key.
    pub async fn delete_all(&self) -> DepotResult<()> {
        self.source_of_truth.delete_all().await
    }

    /// Number of keys with a live barrier cell.
    pub fn barrier_count(&self) -> usize {
        self.cells.size()
    }
}

fn read_failure<K: StoreKey>(key: &K, error: DepotError) -> DepotError {
    match error {
        DepotError::SourceOfTruth(SourceOfTruthError::ReadFailed { .. }) => error,
        other => SourceOfTruthError::ReadFailed {
            key: key_label(key),
            reason: other.to_string(),
        }
        .into(),
    }
}

fn write_failure<K: StoreKey>(key: &K, error: DepotError) -> DepotError {
    match error {
        DepotError::SourceOfTruth(SourceOfTruthError::WriteFailed { .. }) => error,
        other => SourceOfTruthError::WriteFailed {
            key: key_label(key),
            reason: other.to_string(),
        }
        .into(),
    }
}
