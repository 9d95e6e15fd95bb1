//! Read and write requests.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::outcome::WriteOutcome;
use crate::Timestamp;

/// How a read should combine the cache, the source of truth and the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// Serve the cache and the source of truth; when `refresh` is set, also
    /// fetch and stream the fresher value once it arrives.
    Cached { refresh: bool },
    /// Skip the memory cache and the source of truth until the fetcher has
    /// answered.
    Fresh,
    /// Never read or write the memory cache. Still goes through the source
    /// of truth.
    SkipCache { refresh: bool },
    /// Never touch the fetcher.
    LocalOnly,
}

/// A read request for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest<K> {
    pub key: K,
    pub mode: ReadMode,
}

impl<K> ReadRequest<K> {
    pub fn new(key: K, mode: ReadMode) -> Self {
        Self { key, mode }
    }

    /// Serve local data, fetching only if nothing is local (or `refresh`).
    pub fn cached(key: K, refresh: bool) -> Self {
        Self::new(key, ReadMode::Cached { refresh })
    }

    /// Force a remote fetch.
    pub fn fresh(key: K) -> Self {
        Self::new(key, ReadMode::Fresh)
    }

    /// Bypass the memory cache.
    pub fn skip_cache(key: K, refresh: bool) -> Self {
        Self::new(key, ReadMode::SkipCache { refresh })
    }

    /// Serve only what is already local.
    pub fn local_only(key: K) -> Self {
        Self::new(key, ReadMode::LocalOnly)
    }

    pub fn skips_memory(&self) -> bool {
        matches!(self.mode, ReadMode::Fresh | ReadMode::SkipCache { .. })
    }

    pub fn skips_source_of_truth(&self) -> bool {
        matches!(self.mode, ReadMode::Fresh)
    }

    pub fn refresh(&self) -> bool {
        match self.mode {
            ReadMode::Cached { refresh } | ReadMode::SkipCache { refresh } => refresh,
            ReadMode::Fresh => true,
            ReadMode::LocalOnly => false,
        }
    }

    pub fn is_local_only(&self) -> bool {
        matches!(self.mode, ReadMode::LocalOnly)
    }
}

/// Callback fired once when a queued write is acknowledged by the remote
/// origin.
pub type WriteCompletion<R> = Box<dyn FnOnce(&WriteOutcome<R>) + Send>;

/// A local mutation to be propagated to the remote origin.
pub struct WriteRequest<K, V, R> {
    /// Correlation id (UUIDv7, timestamp-sortable).
    pub id: Uuid,
    pub key: K,
    pub value: V,
    pub created_at: Timestamp,
    pub completions: Vec<WriteCompletion<R>>,
}

impl<K, V, R> WriteRequest<K, V, R> {
    pub fn new(key: K, value: V) -> Self {
        Self {
            id: Uuid::now_v7(),
            key,
            value,
            created_at: Utc::now(),
            completions: Vec::new(),
        }
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Register a callback fired when this write is acknowledged.
    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(&WriteOutcome<R>) + Send + 'static,
    {
        self.completions.push(Box::new(completion));
        self
    }
}

impl<K: fmt::Debug, V: fmt::Debug, R> fmt::Debug for WriteRequest<K, V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("created_at", &self.created_at)
            .field("completions", &self.completions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_cached() {
        let req = ReadRequest::cached(3, false);
        assert!(!req.skips_memory());
        assert!(!req.skips_source_of_truth());
        assert!(!req.refresh());

        let req = ReadRequest::cached(3, true);
        assert!(req.refresh());
    }

    #[test]
    fn test_read_request_fresh_skips_everything_local() {
        let req = ReadRequest::fresh("k");
        assert!(req.skips_memory());
        assert!(req.skips_source_of_truth());
        assert!(req.refresh());
    }

    #[test]
    fn test_read_request_skip_cache_keeps_source_of_truth() {
        let req = ReadRequest::skip_cache("k", false);
        assert!(req.skips_memory());
        assert!(!req.skips_source_of_truth());
        assert!(!req.refresh());
    }

    #[test]
    fn test_read_request_local_only() {
        let req = ReadRequest::local_only(1);
        assert!(req.is_local_only());
        assert!(!req.refresh());
    }

    #[test]
    fn test_write_request_completions_registered_in_order() {
        let req: WriteRequest<u32, &str, ()> = WriteRequest::new(1, "a")
            .on_complete(|_| {})
            .on_complete(|_| {});
        assert_eq!(req.completions.len(), 2);
        assert_eq!(req.id.get_version_num(), 7);
    }

    #[test]
    fn test_write_request_with_created_at() {
        let at = chrono::DateTime::UNIX_EPOCH;
        let req: WriteRequest<u32, &str, ()> = WriteRequest::new(1, "a").with_created_at(at);
        assert_eq!(req.created_at, at);
        assert!(format!("{:?}", req).contains("completions: 0"));
    }
}
