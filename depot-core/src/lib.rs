//! Depot Core - Read/Write Vocabulary
//!
//! Types shared by every layer of the depot consistency engine: requests,
//! tagged outcomes, errors, configuration and the capability traits the
//! engine consumes. This crate contains no orchestration logic.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::hash::Hash;

pub mod capability;
pub mod config;
pub mod error;
pub mod outcome;
pub mod request;

pub use capability::{
    fetcher_fn, Bookkeeper, Cache, Fetcher, FnFetcher, SourceOfTruth, SyncFailureRecord, Updater,
};
pub use config::{MemoryPolicy, StoreConfig, DEFAULT_FETCH_BUFFER_CAPACITY};
pub use error::{
    key_label, BookkeeperError, ConfigError, DepotError, DepotResult, FetchError,
    SourceOfTruthError, UpdateError,
};
pub use outcome::{
    FetcherResult, ReadOrigin, ReadOutcome, UpdaterResult, UpdaterSuccess, WriteOutcome,
};
pub use request::{ReadMode, ReadRequest, WriteCompletion, WriteRequest};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Bound for store keys.
///
/// Keys are hashed into per-key registries and shared across tasks.
pub trait StoreKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> StoreKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bound for store values.
pub trait StoreValue: Clone + Debug + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Debug + Send + Sync + 'static {}
