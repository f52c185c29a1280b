use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VaultError, VaultResult};

/// Top-level daemon configuration (loaded from vaultsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub daemon: DaemonConfig,
    pub downloader: DownloaderConfig,
    pub storage: StorageConfig,
    pub indexer: IndexerConfig,
    pub folders: Vec<FolderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Swarm scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Seconds before an unanswered block request is considered dropped
    pub request_timeout_secs: u64,
    /// Global cap on in-flight block requests per folder
    pub download_slots: usize,
    /// Cap on in-flight block requests for a single chunk
    pub max_requests_per_chunk: usize,
    /// Largest block requested from a peer in one message
    pub block_size: u32,
    /// Interval of the request maintenance tick
    pub maintain_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunks held in the in-memory tier
    pub mem_cache_chunks: usize,
    /// Index backend: "json" or "rocksdb"
    pub index_backend: String,
    /// Retry limit for encrypted-store writes
    pub io_retries: u32,
    /// Blocking worker count (0 = cpu_count)
    pub workers: usize,
}

/// Content-defined chunking bounds used by the local indexer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub min_chunksize: u32,
    pub avg_chunksize: u32,
    pub max_chunksize: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Root of the synchronized tree
    pub path: PathBuf,
    /// Folder secret in its text form
    pub secret: String,
    /// Index and encrypted chunk store location (default: `<path>/.vaultsync`)
    #[serde(default)]
    pub system_path: Option<PathBuf>,
}

impl FolderConfig {
    pub fn system_path(&self) -> PathBuf {
        self.system_path
            .clone()
            .unwrap_or_else(|| self.path.join(".vaultsync"))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            download_slots: 10,
            max_requests_per_chunk: 4,
            block_size: 32 * 1024,
            maintain_interval_ms: 1000,
        }
    }
}

impl DownloaderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_millis(self.maintain_interval_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mem_cache_chunks: 64,
            index_backend: "json".into(),
            io_retries: 3,
            workers: 0,
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            min_chunksize: 32 * 1024,
            avg_chunksize: 256 * 1024,
            max_chunksize: 1024 * 1024,
        }
    }
}

impl VaultConfig {
    /// Parse a TOML document and check value ranges.
    pub fn from_toml(text: &str) -> VaultResult<Self> {
        let config: VaultConfig =
            toml::from_str(text).map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> VaultResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> VaultResult<()> {
        let d = &self.downloader;
        if d.download_slots == 0 || d.max_requests_per_chunk == 0 {
            return Err(VaultError::Config(
                "downloader slots must be non-zero".into(),
            ));
        }
        if d.block_size == 0 {
            return Err(VaultError::Config("block_size must be non-zero".into()));
        }
        let i = &self.indexer;
        if !(i.min_chunksize <= i.avg_chunksize && i.avg_chunksize <= i.max_chunksize) {
            return Err(VaultError::Config(format!(
                "chunk sizes out of order: min={} avg={} max={}",
                i.min_chunksize, i.avg_chunksize, i.max_chunksize
            )));
        }
        match self.storage.index_backend.as_str() {
            "json" | "rocksdb" => {}
            other => {
                return Err(VaultError::Config(format!(
                    "unknown index backend: {other}"
                )))
            }
        }
        Ok(())
    }
}
