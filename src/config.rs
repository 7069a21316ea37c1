use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StorageError;

/// Tuning knobs of one sync session. Durations are read and written as
/// milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(with = "millis")]
    pub debounce: Duration,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub retry_base_delay: Duration,
    #[serde(with = "millis")]
    pub slow_poll_interval: Duration,
    #[serde(with = "millis")]
    pub fast_poll_interval: Duration,
    #[serde(with = "millis")]
    pub fast_mode_window: Duration,
    #[serde(with = "millis")]
    pub poll_timeout: Duration,
    pub history_limit: usize,
    pub history_cache_entries: usize,
    pub history_cache_documents: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce: Duration::from_millis(200),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1000),
            slow_poll_interval: Duration::from_secs(5),
            fast_poll_interval: Duration::from_secs(1),
            fast_mode_window: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(8),
            history_limit: 50,
            history_cache_entries: 10,
            history_cache_documents: 16,
        }
    }
}

impl SyncConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let text = std::fs::read_to_string(path)?;
        let config: SyncConfig =
            serde_json::from_str(&text).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SHEETSYNC_*` environment variables holding
    /// milliseconds or counts, e.g. `SHEETSYNC_DEBOUNCE_MS=250`.
    pub fn from_env() -> Result<Self, StorageError> {
        let mut config = SyncConfig::default();
        override_millis("SHEETSYNC_DEBOUNCE_MS", &mut config.debounce)?;
        override_number("SHEETSYNC_MAX_RETRIES", &mut config.max_retries)?;
        override_millis("SHEETSYNC_RETRY_BASE_DELAY_MS", &mut config.retry_base_delay)?;
        override_millis("SHEETSYNC_SLOW_POLL_MS", &mut config.slow_poll_interval)?;
        override_millis("SHEETSYNC_FAST_POLL_MS", &mut config.fast_poll_interval)?;
        override_millis("SHEETSYNC_FAST_WINDOW_MS", &mut config.fast_mode_window)?;
        override_millis("SHEETSYNC_POLL_TIMEOUT_MS", &mut config.poll_timeout)?;
        override_number("SHEETSYNC_HISTORY_LIMIT", &mut config.history_limit)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.slow_poll_interval.is_zero() || self.fast_poll_interval.is_zero() {
            return Err(StorageError::Config("poll intervals must be positive".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(StorageError::Config("poll timeout must be positive".into()));
        }
        if self.history_limit == 0 {
            return Err(StorageError::Config("history limit must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(StorageError::Config("at least one save attempt is required".into()));
        }
        Ok(())
    }
}

/// Where the document server listens and keeps its files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:3000".to_string(),
            data_dir: Some(PathBuf::from("database")),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();
        if let Ok(bind) = env::var("SHEETSYNC_BIND") {
            config.bind = bind;
        }
        match env::var("SHEETSYNC_DATA_DIR") {
            Ok(dir) if dir.is_empty() => config.data_dir = None,
            Ok(dir) => config.data_dir = Some(PathBuf::from(dir)),
            Err(_) => {}
        }
        config
    }
}

fn override_millis(key: &str, target: &mut Duration) -> Result<(), StorageError> {
    let mut ms = target.as_millis() as u64;
    override_number(key, &mut ms)?;
    *target = Duration::from_millis(ms);
    Ok(())
}

fn override_number<T: std::str::FromStr>(key: &str, target: &mut T) -> Result<(), StorageError> {
    if let Ok(raw) = env::var(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| StorageError::Config(format!("{} is not a number: {}", key, raw)))?;
    }
    Ok(())
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
