//! Store configuration.
//!
//! A `StoreConfig` is built once at startup, either programmatically or from
//! `SYNCLOG_*` environment variables, and handed to `SyncState::open`.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EVENTS_DB_NAME: &str = "events.db";
pub const STORAGE_DB_NAME: &str = "storage.db";
pub const COPIES_DIR_NAME: &str = "copies";
pub const COPIES_DB_NAME: &str = "copies.db";

const DEFAULT_SOFT_LOCK_TIMEOUT_MS: &str = "2000";
const DEFAULT_SOFT_LOCK_POLL_MS: u64 = 200;
const DEFAULT_BUSY_TIMEOUT_MS: &str = "60000";
const DEFAULT_PAGE_SIZE: &str = "100";
const DEFAULT_MAX_CONNECTIONS: &str = "4";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings shared by the three stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `events.db`, `storage.db` and `copies/`
    pub data_dir: PathBuf,
    /// Budget for acquiring the event store's soft lock
    pub soft_lock_timeout: Duration,
    pub soft_lock_poll_interval: Duration,
    /// `SQLite` busy handler timeout
    pub busy_timeout: Duration,
    /// Rows per page for tree walks and batched flushes
    pub page_size: usize,
    pub max_connections: usize,
    /// Log every reference change on the `synclog::copies` target
    pub extended_copy_logging: bool,
}

impl StoreConfig {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            soft_lock_timeout: Duration::from_millis(2000),
            soft_lock_poll_interval: Duration::from_millis(DEFAULT_SOFT_LOCK_POLL_MS),
            busy_timeout: Duration::from_millis(60_000),
            page_size: 100,
            max_connections: 4,
            extended_copy_logging: false,
        }
    }

    #[must_use]
    pub const fn with_soft_lock_timeout(mut self, timeout: Duration) -> Self {
        self.soft_lock_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_soft_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.soft_lock_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    #[must_use]
    pub const fn with_extended_copy_logging(mut self, enabled: bool) -> Self {
        self.extended_copy_logging = enabled;
        self
    }

    pub fn events_db_path(&self) -> PathBuf {
        self.data_dir.join(EVENTS_DB_NAME)
    }

    pub fn storage_db_path(&self) -> PathBuf {
        self.data_dir.join(STORAGE_DB_NAME)
    }

    pub fn copies_dir(&self) -> PathBuf {
        self.data_dir.join(COPIES_DIR_NAME)
    }

    pub fn copies_db_path(&self) -> PathBuf {
        self.copies_dir().join(COPIES_DB_NAME)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Like [`Self::from_env`], but an explicit data dir wins over the variable.
    pub fn from_env_with_data_dir(data_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut values: HashMap<String, String> = env::vars().collect();
        if let Some(dir) = data_dir {
            values.insert(
                "SYNCLOG_DATA_DIR".to_string(),
                dir.to_string_lossy().into_owned(),
            );
        }
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(required_trimmed(&lookup, "SYNCLOG_DATA_DIR")?);

        let soft_lock_timeout_ms = value_or_default(
            &lookup,
            "SYNCLOG_SOFT_LOCK_TIMEOUT_MS",
            DEFAULT_SOFT_LOCK_TIMEOUT_MS,
        )
        .parse::<u64>()
        .map_err(|_| {
            ConfigError::Invalid("SYNCLOG_SOFT_LOCK_TIMEOUT_MS must be an integer".to_string())
        })?;

        let busy_timeout_ms =
            value_or_default(&lookup, "SYNCLOG_BUSY_TIMEOUT_MS", DEFAULT_BUSY_TIMEOUT_MS)
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::Invalid("SYNCLOG_BUSY_TIMEOUT_MS must be an integer".to_string())
                })?;

        let page_size = value_or_default(&lookup, "SYNCLOG_PAGE_SIZE", DEFAULT_PAGE_SIZE)
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("SYNCLOG_PAGE_SIZE must be an integer in [1, 999]".to_string())
            })?;
        if !(1..=999).contains(&page_size) {
            return Err(ConfigError::Invalid(
                "SYNCLOG_PAGE_SIZE must be in [1, 999]".to_string(),
            ));
        }

        let max_connections =
            value_or_default(&lookup, "SYNCLOG_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)
                .parse::<usize>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SYNCLOG_MAX_CONNECTIONS must be an integer in [1, 64]".to_string(),
                    )
                })?;
        if !(1..=64).contains(&max_connections) {
            return Err(ConfigError::Invalid(
                "SYNCLOG_MAX_CONNECTIONS must be in [1, 64]".to_string(),
            ));
        }

        let extended_copy_logging = optional_trimmed(&lookup, "SYNCLOG_EXTENDED_COPY_LOGGING")
            .map(|value| parse_flag(&value))
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            soft_lock_timeout: Duration::from_millis(soft_lock_timeout_ms),
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            page_size,
            max_connections,
            extended_copy_logging,
            ..Self::new(data_dir)
        })
    }
}

fn parse_flag(value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(
            "SYNCLOG_EXTENDED_COPY_LOGGING must be a boolean".to_string(),
        )),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn config_from(map: &HashMap<&str, &str>) -> Result<StoreConfig, ConfigError> {
        StoreConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_data_dir() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = config_from(&map).unwrap_err();
        assert!(err.to_string().contains("SYNCLOG_DATA_DIR"));
    }

    #[test]
    fn config_defaults() {
        let mut map = HashMap::new();
        map.insert("SYNCLOG_DATA_DIR", " /var/lib/synclog ");

        let config = config_from(&map).unwrap();
        assert_eq!(config, StoreConfig::new("/var/lib/synclog"));
        assert_eq!(config.soft_lock_timeout, Duration::from_secs(2));
        assert_eq!(config.page_size, 100);
        assert_eq!(
            config.copies_db_path(),
            PathBuf::from("/var/lib/synclog/copies/copies.db")
        );
    }

    #[test]
    fn config_reads_overrides() {
        let mut map = HashMap::new();
        map.insert("SYNCLOG_DATA_DIR", "/data");
        map.insert("SYNCLOG_SOFT_LOCK_TIMEOUT_MS", "500");
        map.insert("SYNCLOG_PAGE_SIZE", "25");
        map.insert("SYNCLOG_EXTENDED_COPY_LOGGING", "yes");

        let config = config_from(&map).unwrap();
        assert_eq!(config.soft_lock_timeout, Duration::from_millis(500));
        assert_eq!(config.page_size, 25);
        assert!(config.extended_copy_logging);
    }

    #[test]
    fn config_rejects_out_of_range_page_size() {
        let mut map = HashMap::new();
        map.insert("SYNCLOG_DATA_DIR", "/data");
        map.insert("SYNCLOG_PAGE_SIZE", "0");
        assert!(matches!(config_from(&map), Err(ConfigError::Invalid(_))));

        map.insert("SYNCLOG_PAGE_SIZE", "many");
        assert!(matches!(config_from(&map), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_rejects_bad_flag() {
        let mut map = HashMap::new();
        map.insert("SYNCLOG_DATA_DIR", "/data");
        map.insert("SYNCLOG_EXTENDED_COPY_LOGGING", "maybe");
        assert!(config_from(&map).is_err());
    }
}
