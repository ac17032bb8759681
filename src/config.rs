//! Configuration management for bridgefs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Minimum number of attempts for a gateway mutation
pub const MIN_TX_RETRY: u32 = 3;

/// Default size of the request worker pool
pub const DEFAULT_WORKER_THREADS: usize = 8;

/// Default backoff base between gateway retries
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 25;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing store layout
    pub storage: StorageConfig,

    /// Mount configuration
    pub mount: MountConfig,

    /// Persistence gateway behaviour
    pub gateway: GatewayConfig,

    /// Content deduplication
    pub dedup: DedupConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the sharded content store
    pub content_root: PathBuf,

    /// Metadata database path
    pub metadata_db: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Default file permissions
    pub default_file_mode: u32,

    /// Default directory permissions
    pub default_dir_mode: u32,

    /// UID for files
    pub uid: u32,

    /// GID for files
    pub gid: u32,

    /// Threads serving blocking kernel requests
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

/// Gateway retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Attempts for every mutating gateway call
    pub tx_retry: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,
}

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Point identical uploads at a single physical copy
    pub enabled: bool,

    /// Which records are searched for a matching checksum
    pub scope: DedupScope,
}

/// Set of records a released file is deduplicated against
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Any record in the store
    #[default]
    Global,
    /// Only records in the same project
    Project,
}

impl std::str::FromStr for DedupScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(DedupScope::Global),
            "project" => Ok(DedupScope::Project),
            other => Err(Error::InvalidConfig(format!(
                "unknown dedup scope '{}'",
                other
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bridgefs");

        Config {
            storage: StorageConfig {
                content_root: data_dir.join("objects"),
                metadata_db: data_dir.join("metadata.db"),
            },
            mount: MountConfig::default(),
            gateway: GatewayConfig::default(),
            dedup: DedupConfig::default(),
            data_dir,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/bridgefs"),
            allow_other: false,
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            tx_retry: MIN_TX_RETRY,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            enabled: true,
            scope: DedupScope::Global,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("BRIDGEFS_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.storage.content_root = PathBuf::from(root);
            }
        }

        if let Ok(db) = std::env::var("BRIDGEFS_DB") {
            let db = db.trim();
            if !db.is_empty() {
                self.storage.metadata_db = PathBuf::from(db);
            }
        }

        if let Ok(scope) = std::env::var("BRIDGEFS_DEDUP_SCOPE") {
            if let Ok(scope) = scope.parse::<DedupScope>() {
                self.dedup.scope = scope;
            }
        }

        if let Ok(retry) = std::env::var("BRIDGEFS_TX_RETRY") {
            if let Ok(n) = retry.trim().parse::<u32>() {
                self.gateway.tx_retry = n;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.content_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Content root is required".to_string(),
            ));
        }

        if self.storage.metadata_db.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Metadata database path is required".to_string(),
            ));
        }

        if self.gateway.tx_retry < MIN_TX_RETRY {
            return Err(Error::InvalidConfig(format!(
                "Gateway retry count must be at least {}",
                MIN_TX_RETRY
            )));
        }

        if self.mount.worker_threads == 0 {
            return Err(Error::InvalidConfig(
                "At least one worker thread is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.storage.content_root)?;
        if let Some(parent) = self.storage.metadata_db.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.tx_retry, MIN_TX_RETRY);
        assert_eq!(config.dedup.scope, DedupScope::Global);
    }

    #[test]
    fn test_retry_budget_below_minimum_rejected() {
        let mut config = Config::default();
        config.gateway.tx_retry = 2;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_worker_threads() {
        let mut config = Config::default();
        assert_eq!(config.mount.worker_threads, DEFAULT_WORKER_THREADS);
        config.mount.worker_threads = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // older config files have no worker count
        let mut raw = serde_json::to_value(Config::default()).unwrap();
        raw["mount"].as_object_mut().unwrap().remove("worker_threads");
        let loaded: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(loaded.mount.worker_threads, DEFAULT_WORKER_THREADS);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.storage.content_root = dir.path().join("objects");
        config.dedup.scope = DedupScope::Project;
        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"project\""));

        let loaded: Config = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.dedup.scope, DedupScope::Project);
        assert_eq!(loaded.storage.content_root, dir.path().join("objects"));
    }

    #[test]
    fn test_dedup_scope_parse() {
        assert_eq!("Global".parse::<DedupScope>().unwrap(), DedupScope::Global);
        assert_eq!(" project ".parse::<DedupScope>().unwrap(), DedupScope::Project);
        assert!("tenant".parse::<DedupScope>().is_err());
    }
}
