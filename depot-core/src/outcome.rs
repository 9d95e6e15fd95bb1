//! Read and write outcomes.
//!
//! Every value or error the engine hands back is tagged with the
//! [`ReadOrigin`] it came from, so callers can reason about freshness
//! without inspecting the engine's internals.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DepotError, FetchError, UpdateError};

/// Where an emitted value or error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadOrigin {
    /// The in-memory cache.
    Cache,
    /// The durable local store.
    SourceOfTruth,
    /// The remote origin.
    Fetcher,
}

impl ReadOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadOrigin::Cache => "cache",
            ReadOrigin::SourceOfTruth => "source_of_truth",
            ReadOrigin::Fetcher => "fetcher",
        }
    }
}

impl fmt::Display for ReadOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event of a read subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<V> {
    /// A remote fetch is in progress.
    Loading { origin: ReadOrigin },
    /// A value.
    Data { value: V, origin: ReadOrigin },
    /// The origin had nothing to say (e.g. the fetch stream was empty).
    NoNewData { origin: ReadOrigin },
    /// A failure. The subscription keeps running after an error.
    Error { error: DepotError, origin: ReadOrigin },
}

impl<V> ReadOutcome<V> {
    pub fn loading(origin: ReadOrigin) -> Self {
        Self::Loading { origin }
    }

    pub fn data(value: V, origin: ReadOrigin) -> Self {
        Self::Data { value, origin }
    }

    pub fn no_new_data(origin: ReadOrigin) -> Self {
        Self::NoNewData { origin }
    }

    pub fn error(error: impl Into<DepotError>, origin: ReadOrigin) -> Self {
        Self::Error {
            error: error.into(),
            origin,
        }
    }

    pub fn origin(&self) -> ReadOrigin {
        match self {
            Self::Loading { origin }
            | Self::Data { origin, .. }
            | Self::NoNewData { origin }
            | Self::Error { origin, .. } => *origin,
        }
    }

    /// Borrow the value if this is a `Data` event.
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Data { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Take the value if this is a `Data` event.
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Data { value, .. } => Some(value),
            _ => None,
        }
    }

    /// `Some(Ok)` for data, `Some(Err)` for errors, `None` for progress
    /// signals (`Loading`, `NoNewData`).
    pub fn into_result(self) -> Option<Result<V, DepotError>> {
        match self {
            Self::Data { value, .. } => Some(Ok(value)),
            Self::Error { error, .. } => Some(Err(error)),
            Self::Loading { .. } | Self::NoNewData { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Error { error, .. } => Some(error.to_string()),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Map the carried value, keeping origin and event kind.
    pub fn map<U, F>(self, f: F) -> ReadOutcome<U>
    where
        F: FnOnce(V) -> U,
    {
        match self {
            Self::Loading { origin } => ReadOutcome::Loading { origin },
            Self::Data { value, origin } => ReadOutcome::Data {
                value: f(value),
                origin,
            },
            Self::NoNewData { origin } => ReadOutcome::NoNewData { origin },
            Self::Error { error, origin } => ReadOutcome::Error { error, origin },
        }
    }
}

/// One item of a remote fetch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FetcherResult<V> {
    Data(V),
    Error(FetchError),
}

impl<V> FetcherResult<V> {
    /// Textual failure reported by the remote origin.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Error(FetchError::Message {
            message: message.into(),
        })
    }

    /// Failure raised while fetching `key`.
    pub fn failed<K: fmt::Debug>(key: &K, reason: impl fmt::Display) -> Self {
        Self::Error(FetchError::Failed {
            key: crate::error::key_label(key),
            reason: reason.to_string(),
        })
    }

    /// Tag this fetch result as a read outcome from the remote origin.
    pub fn into_outcome(self) -> ReadOutcome<V> {
        match self {
            Self::Data(value) => ReadOutcome::data(value, ReadOrigin::Fetcher),
            Self::Error(error) => ReadOutcome::error(error, ReadOrigin::Fetcher),
        }
    }
}

/// Successful remote write payload.
///
/// `Typed` carries the updater's response type; `Untyped` carries whatever
/// the remote origin answered when it didn't match that type.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterSuccess<R> {
    Typed(R),
    Untyped(serde_json::Value),
}

impl<R> UpdaterSuccess<R> {
    pub fn typed(&self) -> Option<&R> {
        match self {
            Self::Typed(value) => Some(value),
            Self::Untyped(_) => None,
        }
    }
}

/// Result of posting a value to the remote origin.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterResult<R> {
    Success(UpdaterSuccess<R>),
    Error(UpdateError),
}

impl<R> UpdaterResult<R> {
    pub fn typed(value: R) -> Self {
        Self::Success(UpdaterSuccess::Typed(value))
    }

    pub fn untyped(value: serde_json::Value) -> Self {
        Self::Success(UpdaterSuccess::Untyped(value))
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Error(UpdateError::Rejected {
            message: message.into(),
        })
    }

    pub fn failed<K: fmt::Debug>(key: &K, reason: impl fmt::Display) -> Self {
        Self::Error(UpdateError::Failed {
            key: crate::error::key_label(key),
            reason: reason.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Result of a store write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<R> {
    Success(UpdaterSuccess<R>),
    Error(DepotError),
}

impl<R> WriteOutcome<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl<R> From<UpdaterResult<R>> for WriteOutcome<R> {
    fn from(result: UpdaterResult<R>) -> Self {
        match result {
            UpdaterResult::Success(success) => WriteOutcome::Success(success),
            UpdaterResult::Error(error) => WriteOutcome::Error(error.into()),
        }
    }
}
