//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Worker pool configuration
    pub workers: WorkerConfig,

    /// Commit retry configuration
    pub store: CommitConfig,

    /// Reconciliation configuration
    pub reconcile: ReconcileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/pocket-ledger"),
            service_name: "pocket-ledger".to_string(),
            rocksdb: RocksDBConfig::default(),
            workers: WorkerConfig::default(),
            store: CommitConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every commit
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 16,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads executing mutating operations
    pub pool_size: usize,

    /// Maximum submitted-but-unfinished units before submitters wait
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 1024,
        }
    }
}

/// Retry policy for units of work whose commit failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Retries after the first failed attempt
    pub max_commit_retries: u32,

    /// Backoff between attempts (milliseconds, multiplied by attempt number)
    pub retry_backoff_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
            retry_backoff_ms: 5,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run a reconciliation pass when the ledger is opened
    pub on_open: bool,

    /// Run the scheduled reconciler
    pub scheduled: bool,

    /// Interval between scheduled passes (seconds)
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            on_open: true,
            scheduled: false,
            interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(workers) = std::env::var("LEDGER_WORKERS") {
            config.workers.pool_size = workers
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid LEDGER_WORKERS: {}", e)))?;
        }

        if let Ok(interval) = std::env::var("LEDGER_RECONCILE_INTERVAL_SECS") {
            config.reconcile.interval_secs = interval.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_RECONCILE_INTERVAL_SECS: {}", e))
            })?;
            config.reconcile.scheduled = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers.pool_size == 0 {
            return Err(crate::Error::Config(
                "workers.pool_size must be at least 1".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "workers.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconcile.scheduled && self.reconcile.interval_secs == 0 {
            return Err(crate::Error::Config(
                "reconcile.interval_secs must be positive when scheduled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "pocket-ledger");
        assert_eq!(config.workers.pool_size, 4);
        assert!(config.reconcile.on_open);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let mut config = Config::default();
        config.workers.pool_size = 8;
        config.reconcile.scheduled = true;
        config.reconcile.interval_secs = 60;
        let text = toml::to_string(&config).unwrap();

        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.workers.pool_size, 8);
        assert!(parsed.reconcile.scheduled);
        assert_eq!(parsed.reconcile.interval_secs, 60);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.workers.pool_size = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let result = Config::from_toml("data_dir = ");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
