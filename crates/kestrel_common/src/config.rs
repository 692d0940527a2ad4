use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};

/// Smallest transaction log split size accepted by `validate()`.
pub const MIN_TRLOG_FILE_SIZE: u64 = 1024;
/// Largest transaction log split size accepted by `validate()`.
pub const MAX_TRLOG_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Top-level store configuration (kestrel.toml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the file collection.
    pub dir: PathBuf,
    /// A transaction log is closed and a new one opened before a command
    /// would push it past this many bytes.
    pub max_trlog_file_size: u64,
    /// Force a physical flush of the log before `commit()` returns.
    pub durable_transactions: bool,
    /// Pending bytes an appender buffers before writing them to the file.
    pub write_buffer_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("kestrel-data"),
            max_trlog_file_size: 64 * 1024 * 1024,
            durable_transactions: false,
            write_buffer_bytes: 64 * 1024,
        }
    }
}

/// Compaction scheduler policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Spawn the background compaction thread on open.
    pub background: bool,
    /// Log bytes written since the last checkpoint that trigger a fresh
    /// checkpoint. 0 = a quarter of `max_trlog_file_size`.
    pub key_index_distance: u64,
    /// When set, a checkpoint is also written at startup if the replayed
    /// log tail is longer than this many bytes.
    pub startup_checkpoint_distance: Option<u64>,
    /// Fraction of dead bytes in a value file above which its live values
    /// are relocated into a fresh pure-values file.
    pub waste_ratio: f64,
    /// Period of the re-check while waiting for old snapshots to drain.
    pub reclaim_recheck_ms: u64,
    /// Idle wake-up period of the scheduler when nobody advises a run.
    pub idle_poll_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            background: true,
            key_index_distance: 0,
            startup_checkpoint_distance: None,
            waste_ratio: 0.5,
            reclaim_recheck_ms: 100,
            idle_poll_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Keys shorter than this are never compressed.
    pub min_key_len: usize,
    /// Values shorter than this are never compressed.
    pub min_value_len: usize,
    /// zstd level.
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_key_len: 1024,
            min_value_len: 512,
            level: 3,
        }
    }
}

impl KvConfig {
    /// Configuration with defaults rooted at `dir`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.dir = dir.into();
        config
    }

    pub fn from_toml_str(content: &str) -> KvResult<Self> {
        let config: KvConfig =
            toml::from_str(content).map_err(|e| KvError::Config(e.to_string()))?;
        config.validate().map_err(KvError::Config)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> KvResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KvError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), dir = %config.storage.dir.display(), "configuration loaded");
        Ok(config)
    }

    /// Effective checkpoint distance after resolving the 0 = auto default.
    pub fn key_index_distance(&self) -> u64 {
        if self.compaction.key_index_distance == 0 {
            self.storage.max_trlog_file_size / 4
        } else {
            self.compaction.key_index_distance
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let size = self.storage.max_trlog_file_size;
        if !(MIN_TRLOG_FILE_SIZE..=MAX_TRLOG_FILE_SIZE).contains(&size) {
            return Err(format!(
                "max_trlog_file_size must be within {}..={} (got {})",
                MIN_TRLOG_FILE_SIZE, MAX_TRLOG_FILE_SIZE, size
            ));
        }
        if self.storage.write_buffer_bytes == 0 {
            return Err("write_buffer_bytes must be >= 1".into());
        }
        if !(self.compaction.waste_ratio > 0.0 && self.compaction.waste_ratio <= 1.0) {
            return Err("waste_ratio must be within (0, 1]".into());
        }
        if self.compaction.reclaim_recheck_ms == 0 {
            return Err("reclaim_recheck_ms must be >= 1".into());
        }
        if !(-7..=22).contains(&self.compression.level) {
            return Err("compression level must be within -7..=22".into());
        }
        Ok(())
    }
}
