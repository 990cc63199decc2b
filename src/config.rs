use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ErrorKind, StoreError, StoreResult};

/// Environment variable overriding the SHM filename prefix.
pub const SHM_PREFIX_ENV: &str = "YANGSTORE_SHM_PREFIX";

/// Configuration for the datastore engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Repository configuration (durable files)
    pub repository: RepositoryConfig,
    /// Shared memory configuration
    pub shm: ShmConfig,
    /// Running-data cache configuration
    pub cache: CacheConfig,
    /// Timeout configuration
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository root; holds data/, yang/, notif/ and the event pipes
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Directory holding the SHM files (typically /dev/shm)
    pub dir: PathBuf,
    /// Filename prefix for all SHM files; must not contain '/'
    pub prefix: String,
    /// Trigger defragmentation when wasted bytes exceed this percentage of
    /// the Ext SHM size
    pub defrag_percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the per-connection running-data cache is enabled
    pub enabled: bool,
    /// Maximum number of module trees kept in the cache
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default timeout for SHM and module lock acquisition in milliseconds
    pub lock_timeout_ms: u64,
    /// Default timeout for provider rendezvous replies in milliseconds
    pub oper_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig {
                path: dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("/var/lib"))
                    .join("yangstore"),
            },
            shm: ShmConfig {
                dir: PathBuf::from("/dev/shm"),
                prefix: "yangstore".to_string(),
                defrag_percent: 25,
            },
            cache: CacheConfig {
                enabled: true,
                capacity: 256,
            },
            timeouts: TimeoutConfig {
                lock_timeout_ms: 5000,  // 5 seconds
                oper_timeout_ms: 10000, // 10 seconds
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::sys(format!("failed to read config {:?}", path), e))?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            StoreError::new(ErrorKind::InvalArg, format!("invalid config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::sys(format!("failed to create {:?}", parent), e))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| {
            StoreError::new(ErrorKind::Internal, format!("config serialization failed: {}", e))
        })?;
        std::fs::write(path, content)
            .map_err(|e| StoreError::sys(format!("failed to write config {:?}", path), e))?;
        Ok(())
    }

    /// Validate the configuration values
    pub fn validate(&self) -> StoreResult<()> {
        validate_prefix(&self.shm.prefix)?;
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(StoreError::new(
                ErrorKind::InvalArg,
                "cache capacity must be non-zero when the cache is enabled",
            ));
        }
        if self.shm.defrag_percent == 0 || self.shm.defrag_percent > 100 {
            return Err(StoreError::new(
                ErrorKind::InvalArg,
                format!("defrag_percent must be in 1..=100, got {}", self.shm.defrag_percent),
            ));
        }
        Ok(())
    }

    /// The effective SHM prefix: the `YANGSTORE_SHM_PREFIX` environment
    /// variable when set, the configured prefix otherwise.
    pub fn effective_prefix(&self) -> StoreResult<String> {
        let prefix = match std::env::var(SHM_PREFIX_ENV) {
            Ok(p) if !p.is_empty() => p,
            _ => self.shm.prefix.clone(),
        };
        validate_prefix(&prefix)?;
        Ok(prefix)
    }

    /// Default deadline for lock acquisition.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.lock_timeout_ms)
    }

    /// Default deadline for provider rendezvous replies.
    pub fn oper_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.oper_timeout_ms)
    }

    // Repository layout helpers.

    pub fn data_dir(&self) -> PathBuf {
        self.repository.path.join("data")
    }

    pub fn yang_dir(&self) -> PathBuf {
        self.repository.path.join("yang")
    }

    pub fn notif_dir(&self) -> PathBuf {
        self.repository.path.join("notif")
    }

    pub fn evpipe_path(&self, num: u32) -> PathBuf {
        self.repository.path.join(format!("ys_evpipe{}", num))
    }

    pub fn conn_locks_dir(&self, prefix: &str) -> PathBuf {
        self.shm.dir.join(format!("{}_conn_locks", prefix))
    }

    pub fn conn_lock_path(&self, prefix: &str, cid: u32) -> PathBuf {
        self.conn_locks_dir(prefix).join(format!("conn_{}.lock", cid))
    }

    pub fn main_shm_path(&self, prefix: &str) -> PathBuf {
        self.shm.dir.join(format!("{}_main", prefix))
    }

    pub fn ext_shm_path(&self, prefix: &str) -> PathBuf {
        self.shm.dir.join(format!("{}_ext", prefix))
    }

    pub fn sub_shm_path(&self, prefix: &str, evpipe: u32) -> PathBuf {
        self.shm.dir.join(format!("{}_sub_{}", prefix, evpipe))
    }
}

fn validate_prefix(prefix: &str) -> StoreResult<()> {
    if prefix.is_empty() {
        return Err(StoreError::new(ErrorKind::InvalArg, "SHM prefix must not be empty"));
    }
    if prefix.contains('/') {
        return Err(StoreError::new(
            ErrorKind::InvalArg,
            format!("SHM prefix '{}' must not contain '/'", prefix),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shm.defrag_percent, 25);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.shm.prefix = "ys_test".to_string();
        config.cache.capacity = 17;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.shm.prefix, "ys_test");
        assert_eq!(loaded.cache.capacity, 17);
    }

    #[test]
    fn test_prefix_with_slash_rejected() {
        let mut config = Config::default();
        config.shm.prefix = "bad/prefix".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalArg);
    }

    #[test]
    fn test_zero_cache_capacity_rejected() {
        let mut config = Config::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_prefix_without_env() {
        // Mutating the env var here would race parallel tests that call
        // connect(); the fallback path is what we pin.
        let mut config = Config::default();
        config.shm.prefix = "from_config".to_string();
        assert_eq!(config.effective_prefix().unwrap(), "from_config");
    }
}
