//! Configuration loading for the corpus cache.
//!
//! All fields are required; component-level defaults live on each
//! component's own config struct.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CORPUS_CACHE_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Broadcast channel namespace shared by every context of this cache.
    pub namespace: String,
    pub schema_version: u32,
    pub memory: MemorySettings,
    pub persistent: PersistentSettings,
    pub worker: WorkerSettings,
    pub fetch: FetchSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySettings {
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistentSettings {
    pub path: PathBuf,
    pub budget_bytes: u64,
    pub map_size_mb: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSettings {
    pub request_timeout_ms: u64,
    pub max_restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchSettings {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl CacheSettings {
    /// Load from `--config <path>` or `CORPUS_CACHE_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let settings = Self::from_path(&path)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "namespace",
                reason: "must not be empty".to_string(),
            });
        }
        if self.schema_version == 0 {
            return Err(ConfigError::InvalidValue {
                field: "schema_version",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.memory.budget_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.budget_bytes",
                reason: "must be > 0".to_string(),
            });
        }
        if self.persistent.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "persistent.path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.persistent.budget_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "persistent.budget_bytes",
                reason: "must be > 0".to_string(),
            });
        }
        if self.persistent.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "persistent.map_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.worker.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.fetch.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "fetch.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.fetch.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch.timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
