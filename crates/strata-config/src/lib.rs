//! # strata-config
//!
//! Configuration management for Strata.
//!
//! Loads configuration from:
//! 1. `~/.strata/config.toml` (global)
//! 2. `.strata/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! There is no process-wide config instance: callers load a [`Config`] and
//! hand it to whatever store they construct.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.strata/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_from(&global_path)?;
            }
        }

        // 2. Project config (.strata/config.toml) overrides global
        let project_path = Path::new(".strata/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_from(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file, without layering or env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.strata/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".strata/config.toml"))
    }

    /// Merge a project config over this one.
    ///
    /// A project file is parsed with `#[serde(default)]`, so only fields that
    /// differ from the defaults are taken from it.
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.storage.root != defaults.storage.root {
            self.storage.root = other.storage.root;
        }
        if other.storage.capacity != defaults.storage.capacity {
            self.storage.capacity = other.storage.capacity;
        }
        if other.storage.reference_counting != defaults.storage.reference_counting {
            self.storage.reference_counting = other.storage.reference_counting;
        }
        if other.storage.hash != defaults.storage.hash {
            self.storage.hash = other.storage.hash;
        }
        if other.cache.capacity != defaults.cache.capacity {
            self.cache.capacity = other.cache.capacity;
        }
        if other.cache.read_through != defaults.cache.read_through {
            self.cache.read_through = other.cache.read_through;
        }
        if other.transfer.workers.is_some() {
            self.transfer.workers = other.transfer.workers;
        }
        if other.transfer.max_retries != defaults.transfer.max_retries {
            self.transfer.max_retries = other.transfer.max_retries;
        }
        if other.transfer.backoff_ms != defaults.transfer.backoff_ms {
            self.transfer.backoff_ms = other.transfer.backoff_ms;
        }
        if other.transfer.max_backoff_ms != defaults.transfer.max_backoff_ms {
            self.transfer.max_backoff_ms = other.transfer.max_backoff_ms;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STRATA_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(workers) = std::env::var("STRATA_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.transfer.workers = Some(n);
            }
        }
        if let Ok(capacity) = std::env::var("STRATA_CACHE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.cache.capacity = n;
            }
        }
    }

    /// Storage root with a leading `~/` expanded to the home directory.
    pub fn resolved_root(&self) -> PathBuf {
        expand_home(&self.storage.root)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Expand a leading `~/` using the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Hashing scheme used to derive and check chunk names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashScheme {
    #[default]
    Blake3,
    Sha256,
}

/// Durable tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunk directory for the file-backed durable tier
    pub root: PathBuf,
    /// Durable capacity in bytes (0 = unbounded)
    pub capacity: u64,
    /// Count repeated stores and only remove a chunk when every reference is deleted
    pub reference_counting: bool,
    /// Name validation scheme
    pub hash: HashScheme,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.strata/chunks"),
            capacity: 0,
            reference_counting: false,
            hash: HashScheme::Blake3,
        }
    }
}

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache capacity in bytes (0 = unbounded)
    pub capacity: u64,
    /// Repopulate the cache from durable reads
    pub read_through: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            read_through: true,
        }
    }
}

/// Background transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Worker threads (None = auto)
    pub workers: Option<usize>,
    /// Retries after the first failed durable write
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further attempt
    pub backoff_ms: u64,
    /// Upper bound for a single retry delay
    pub max_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_retries: 3,
            backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.capacity, 0);
        assert_eq!(config.storage.hash, HashScheme::Blake3);
        assert!(config.cache.read_through);
        assert_eq!(config.transfer.max_retries, 3);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[transfer]"));
        assert!(toml_str.contains("blake3"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.storage.hash = HashScheme::Sha256;
        config.cache.capacity = 4096;
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.storage.hash, HashScheme::Sha256);
        assert_eq!(parsed.cache.capacity, 4096);
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut base = Config::default();
        base.cache.capacity = 1024;
        base.transfer.workers = Some(2);

        let mut project = Config::default();
        project.storage.reference_counting = true;

        base.merge(project);
        assert!(base.storage.reference_counting);
        assert_eq!(base.cache.capacity, 1024);
        assert_eq!(base.transfer.workers, Some(2));
    }

    #[test]
    fn test_expand_home() {
        let plain = Path::new("/var/lib/strata");
        assert_eq!(expand_home(plain), PathBuf::from("/var/lib/strata"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/chunks")), home.join("chunks"));
        }
    }
}
