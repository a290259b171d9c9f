use crate::backend::BackendKind;
use crate::metrics::MetricsConfig;
use crate::queue::DEFAULT_MAX_RETRIES;
use crate::replicate::ReplicationConfig;
use crate::MemError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct MemConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Embedded database file. Defaults to `~/.tracemem/tracemem.db`.
    pub path: Option<PathBuf>,
    /// Connection string for the networked backend.
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Embedded,
            path: None,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How many processed jobs to keep for inspection.
    #[serde(default = "default_processed_retention")]
    pub processed_retention: i64,
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            processed_retention: default_processed_retention(),
            recovery_interval_secs: default_recovery_interval_secs(),
        }
    }
}

fn default_max_retries() -> i64 {
    DEFAULT_MAX_RETRIES
}

fn default_stuck_threshold_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_processed_retention() -> i64 {
    100
}

fn default_recovery_interval_secs() -> u64 {
    60
}

/// Load config from TRACEMEM_CONFIG env var, ~/.tracemem/config.toml, or defaults.
pub fn load_config() -> Result<MemConfig, MemError> {
    match config_path() {
        Some(p) => load_config_from(&p),
        None => finish(MemConfig::default()),
    }
}

/// Load a specific file. A missing file means defaults.
pub fn load_config_from(path: &Path) -> Result<MemConfig, MemError> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| MemError::Config(format!("{}: {e}", path.display())))?
    } else {
        MemConfig::default()
    };
    finish(config)
}

fn finish(mut config: MemConfig) -> Result<MemConfig, MemError> {
    apply_env_overrides(&mut config, std::env::var("TRACEMEM_DATABASE_URL").ok());
    validate_config(&config)?;
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("TRACEMEM_CONFIG") {
        return Some(PathBuf::from(p));
    }
    Some(home_dir()?.join("config.toml"))
}

fn home_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".tracemem"))
}

fn apply_env_overrides(config: &mut MemConfig, database_url: Option<String>) {
    if let Some(url) = database_url
        && !url.trim().is_empty()
    {
        config.storage.database_url = Some(url);
    }
}

pub fn validate_config(config: &MemConfig) -> Result<(), MemError> {
    if config.storage.backend == BackendKind::Networked
        && config
            .storage
            .database_url
            .as_deref()
            .is_none_or(|u| u.trim().is_empty())
    {
        return Err(MemError::Config(
            "storage.backend = \"networked\" requires storage.database_url (or TRACEMEM_DATABASE_URL)"
                .into(),
        ));
    }
    if config.queue.max_retries < 1 {
        return Err(MemError::Config(format!(
            "queue.max_retries must be at least 1, got {}",
            config.queue.max_retries
        )));
    }
    if config.replication.timeout_secs < 1 {
        return Err(MemError::Config(
            "replication.timeout_secs must be at least 1".into(),
        ));
    }
    if config.storage.max_connections < 1 {
        return Err(MemError::Config(
            "storage.max_connections must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Embedded database location: configured path, else under ~/.tracemem.
pub fn resolve_db_path(config: &MemConfig) -> Result<PathBuf, MemError> {
    if let Some(p) = &config.storage.path {
        return Ok(p.clone());
    }
    home_dir()
        .map(|d| d.join("tracemem.db"))
        .ok_or_else(|| MemError::Config("HOME not set and storage.path not configured".into()))
}
