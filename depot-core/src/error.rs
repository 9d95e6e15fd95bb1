//! Error types for depot operations

use thiserror::Error;

/// Remote fetch errors.
///
/// Fetch errors are never fatal: they surface as `ReadOutcome::Error` tagged
/// `ReadOrigin::Fetcher` and leave the shared fetch subscription open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed: {message}")]
    Message { message: String },

    #[error("Fetch failed for key {key}: {reason}")]
    Failed { key: String, reason: String },
}

/// Durable local store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceOfTruthError {
    #[error("Source of truth read failed for key {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Source of truth write failed for key {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Source of truth delete failed for key {key}: {reason}")]
    DeleteFailed { key: String, reason: String },
}

/// Remote write (post) errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Update rejected: {message}")]
    Rejected { message: String },

    #[error("Update failed for key {key}: {reason}")]
    Failed { key: String, reason: String },
}

/// Sync-failure bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BookkeeperError {
    #[error("Bookkeeper unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all depot errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DepotError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Source of truth error: {0}")]
    SourceOfTruth(#[from] SourceOfTruthError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("Bookkeeper error: {0}")]
    Bookkeeper(#[from] BookkeeperError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No data available for key {key}")]
    NoData { key: String },

    #[error("Operation on key {key} was cancelled")]
    Cancelled { key: String },
}

/// Result type alias for depot operations.
pub type DepotResult<T> = Result<T, DepotError>;

/// Render a key for inclusion in an error message.
pub fn key_label<K: std::fmt::Debug>(key: &K) -> String {
    format!("{:?}", key)
}

// =============================================================================
// TESTS
// =============================================================================
