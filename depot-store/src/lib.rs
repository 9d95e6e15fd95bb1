//! Depot Store - Keyed Read/Write Consistency Engine
//!
//! Coordinates an in-memory cache, a durable source of truth and a remote
//! origin behind one streaming read API, and keeps local writes ordered
//! until the remote origin acknowledges them.
//!
//! - [`Store`]: streaming reads with shared fetches and tagged outcomes
//! - [`MutableStore`]: local writes, coalesced posts and conflict resolution
//! - [`SourceOfTruthBarrier`]: blocks source-of-truth reads during writes
//! - [`FetcherMulticaster`]: one remote fetch per key, fanned out
//! - [`WriteRequestLedger`]: per-key queues of unacknowledged writes

pub mod barrier;
pub mod builder;
pub mod conflict;
pub mod latch;
pub mod ledger;
pub mod memory;
pub mod multicast;
pub mod mutable_store;
pub mod ref_counted;
pub mod store;

pub use barrier::{BarrierState, SourceOfTruthBarrier};
pub use builder::StoreBuilder;
pub use conflict::{ConflictResolver, EagerResolution};
pub use latch::Latch;
pub use ledger::{PendingWrite, PostGuard, WriteRequestLedger};
pub use memory::{CacheStats, InMemoryBookkeeper, InMemorySourceOfTruth, MemoryCache};
pub use multicast::FetcherMulticaster;
pub use mutable_store::MutableStore;
pub use ref_counted::{Lease, RefCountedResource};
pub use store::Store;

// Callers name requests, outcomes and capabilities through this crate too.
pub use depot_core::{
    Bookkeeper, Cache, DepotError, DepotResult, Fetcher, FetcherResult, MemoryPolicy, ReadMode,
    ReadOrigin, ReadOutcome, ReadRequest, SourceOfTruth, StoreConfig, Updater, UpdaterResult,
    UpdaterSuccess, WriteOutcome, WriteRequest,
};
