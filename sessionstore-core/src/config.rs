use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::db::validate_identifier;
use crate::error::StoreError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: BackendKind,
    pub url: String,
    pub max_connections: u32,
    pub schema: String,
    pub table: String,
    pub operation_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Postgres,
            url: "postgresql://localhost:5432/sessions".to_string(),
            max_connections: 10,
            schema: "public".to_string(),
            table: "sessions".to_string(),
            operation_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
    }

    /// How long a SQLite connection waits on another writer's lock.
    pub fn sqlite_busy_timeout(&self) -> Duration {
        sqlite_busy_timeout(self.operation_timeout())
    }
}

pub(crate) fn sqlite_busy_timeout(op_timeout: Option<Duration>) -> Duration {
    op_timeout.unwrap_or_default().max(Duration::from_secs(1))
}

/// Tuning knobs for the adaptive bulk upsert engine.
///
/// Values of zero fall back to the defaults; see [`BatchConfig::normalized`].
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per window before any shrinking.
    pub batch_size: usize,
    /// Floor for window shrinking, clamped to `batch_size`.
    pub min_batch_size: usize,
    /// Total attempts allowed per window, across all shrink steps.
    pub max_retries: u32,
    /// Deadline for a single window attempt. Zero disables the deadline.
    pub timeout_seconds: u64,
    /// Pause between committed windows.
    pub throttle_interval_ms: u64,
}

pub const DEFAULT_BATCH_SIZE: usize = 5_000;
pub const DEFAULT_MIN_BATCH_SIZE: usize = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            throttle_interval_ms: 0,
        }
    }
}

impl BatchConfig {
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.batch_size == 0 {
            cfg.batch_size = DEFAULT_BATCH_SIZE;
        }
        if cfg.min_batch_size == 0 {
            cfg.min_batch_size = DEFAULT_MIN_BATCH_SIZE;
        }
        if cfg.min_batch_size > cfg.batch_size {
            cfg.min_batch_size = cfg.batch_size;
        }
        if cfg.max_retries == 0 {
            cfg.max_retries = DEFAULT_MAX_RETRIES;
        }
        cfg
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }

    pub fn throttle(&self) -> Option<Duration> {
        (self.throttle_interval_ms > 0).then(|| Duration::from_millis(self.throttle_interval_ms))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load from a TOML file (optional) layered under `SESSIONSTORE__*`
    /// environment overrides, e.g. `SESSIONSTORE__DATABASE__URL`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("SESSIONSTORE").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_identifier("schema", &self.database.schema)?;
        validate_identifier("table", &self.database.table)?;
        if self.database.backend != BackendKind::Memory && self.database.url.trim().is_empty() {
            return Err(StoreError::Config("database url cannot be empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(StoreError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
