//! Configuration types
//!
//! Loaded from TOML or built programmatically with the `with_*` methods.
//! Always `validate()` before handing a config to a store builder.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default capacity of each per-key fetch fan-out channel.
pub const DEFAULT_FETCH_BUFFER_CAPACITY: usize = 64;

/// Eviction policy for the in-memory cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryPolicy {
    /// Maximum number of entries; least recently used entries are evicted.
    pub max_size: Option<u64>,
    /// Entries expire this long after they were written.
    pub expire_after_write_ms: Option<u64>,
    /// Entries expire this long after they were last read or written.
    pub expire_after_access_ms: Option<u64>,
}

impl MemoryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_expire_after_access(mut self, ttl: Duration) -> Self {
        self.expire_after_access_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn expire_after_write(&self) -> Option<Duration> {
        self.expire_after_write_ms.map(Duration::from_millis)
    }

    pub fn expire_after_access(&self) -> Option<Duration> {
        self.expire_after_access_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "memory_policy.max_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.expire_after_write_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "memory_policy.expire_after_write_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.expire_after_access_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "memory_policy.expire_after_access_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Capacity of each per-key fetch fan-out channel. Slow subscribers that
    /// fall further behind than this miss events.
    #[serde(default = "default_fetch_buffer_capacity")]
    pub fetch_buffer_capacity: usize,
    /// Policy for the default memory cache. `None` disables it unless a
    /// cache is supplied explicitly.
    #[serde(default)]
    pub memory_policy: Option<MemoryPolicy>,
}

fn default_fetch_buffer_capacity() -> usize {
    DEFAULT_FETCH_BUFFER_CAPACITY
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fetch_buffer_capacity: DEFAULT_FETCH_BUFFER_CAPACITY,
            memory_policy: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_buffer_capacity(mut self, capacity: usize) -> Self {
        self.fetch_buffer_capacity = capacity;
        self
    }

    pub fn with_memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = Some(policy);
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - fetch_buffer_capacity > 0
    /// - memory policy bounds and expiries are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch_buffer_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if let Some(policy) = &self.memory_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetch_buffer_capacity, DEFAULT_FETCH_BUFFER_CAPACITY);
        assert!(config.memory_policy.is_none());
    }

    #[test]
    fn test_zero_buffer_capacity_rejected() {
        let err = StoreConfig::new()
            .with_fetch_buffer_capacity(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "fetch_buffer_capacity",
                ..
            }
        ));
    }

    #[test]
    fn test_memory_policy_zero_values_rejected() {
        let err = MemoryPolicy::new().with_max_size(0).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "memory_policy.max_size",
                ..
            }
        ));

        let err = MemoryPolicy::new()
            .with_expire_after_access(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "memory_policy.expire_after_access_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_from_toml_str() {
        let config = StoreConfig::from_toml_str(
            r#"
            fetch_buffer_capacity = 16

            [memory_policy]
            max_size = 100
            expire_after_write_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(config.fetch_buffer_capacity, 16);
        let policy = config.memory_policy.unwrap();
        assert_eq!(policy.max_size, Some(100));
        assert_eq!(policy.expire_after_write(), Some(Duration::from_secs(30)));
        assert_eq!(policy.expire_after_access(), None);
    }

    #[test]
    fn test_from_toml_str_defaults_missing_fields() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn test_from_toml_str_rejects_unknown_fields() {
        let err = StoreConfig::from_toml_str("fetch_buffer = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_toml_str_validates() {
        let err = StoreConfig::from_toml_str("fetch_buffer_capacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fetch_buffer_capacity = 8").unwrap();
        let config = StoreConfig::from_path(file.path()).unwrap();
        assert_eq!(config.fetch_buffer_capacity, 8);

        let err = StoreConfig::from_path(Path::new("/nonexistent/depot.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    proptest::proptest! {
        #[test]
        fn prop_positive_settings_validate(
            capacity in 1usize..4096,
            max_size in proptest::option::of(1u64..10_000),
            ttl_ms in proptest::option::of(1u64..600_000),
        ) {
            let mut policy = MemoryPolicy::new();
            if let Some(max_size) = max_size {
                policy = policy.with_max_size(max_size);
            }
            if let Some(ttl_ms) = ttl_ms {
                policy = policy.with_expire_after_write(Duration::from_millis(ttl_ms));
            }
            let config = StoreConfig::new()
                .with_fetch_buffer_capacity(capacity)
                .with_memory_policy(policy);
            proptest::prop_assert!(config.validate().is_ok());
        }
    }
}
