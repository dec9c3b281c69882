//! Configuration for the shard store
//!
//! This module provides the options shared by the registry and the storage
//! engines it creates for each shard.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::error::{Result, Error};

/// Compression algorithms available for shard snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CompressionAlgorithm {
    /// No compression, fastest but largest snapshots
    None,
    /// LZ4 compression, good balance of speed and compression ratio
    Lz4,
    /// Zstandard compression, better compression than LZ4 but slower
    Zstd,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        #[cfg(feature = "compression")]
        return Self::Zstd;

        #[cfg(not(feature = "compression"))]
        return Self::None;
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl CompressionAlgorithm {
    /// Parse a compression algorithm from a string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            _ => Err(Error::config(format!("Unknown compression algorithm: {}", s))),
        }
    }

    /// Get the name of the compression algorithm
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Tag byte written in snapshot headers
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }

    /// Decode a snapshot header tag byte
    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            _ => Err(Error::corruption(format!("Unknown compression tag: {}", tag))),
        }
    }
}

/// Configuration options for a shard store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct StoreConfig {
    // Layout
    /// Root directory holding `<database>/<retention policy>/<shard id>`
    pub dir: PathBuf,
    /// Root directory for shard write-ahead logs, same layout as `dir`
    pub wal_dir: PathBuf,

    // Index limits
    /// Maximum number of series per database index, 0 disables the limit
    pub max_series_per_database: usize,

    // Lifecycle
    /// Seconds between background maintenance passes, 0 disables them
    pub maintenance_interval_secs: u64,
    /// Open shards found at startup on the rayon pool
    pub parallel_shard_open: bool,

    // Engine settings
    /// Compression algorithm for shard snapshots
    pub compression_algorithm: CompressionAlgorithm,
    /// Compression level (0-9, higher = better compression)
    pub compression_level: i32,
    /// Whether to fsync each WAL append
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            wal_dir: PathBuf::from("wal"),

            max_series_per_database: 1_000_000,

            maintenance_interval_secs: 60,
            parallel_shard_open: true,

            compression_algorithm: CompressionAlgorithm::default(),
            compression_level: 3,
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Create a new store configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration rooted at `dir`, with the WAL root next to it
    /// at `<dir>/../wal` when `dir` has a parent, `<dir>/wal` otherwise
    pub fn with_root<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let wal_dir = match dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("wal"),
            _ => dir.join("wal"),
        };
        Self {
            dir,
            wal_dir,
            ..Self::default()
        }
    }

    /// Set the data root directory
    pub fn with_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the write-ahead log root directory
    pub fn with_wal_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.wal_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the maximum number of series per database
    pub fn with_max_series_per_database(mut self, limit: usize) -> Self {
        self.max_series_per_database = limit;
        self
    }

    /// Set the background maintenance interval in seconds
    pub fn with_maintenance_interval_secs(mut self, secs: u64) -> Self {
        self.maintenance_interval_secs = secs;
        self
    }

    /// Set whether shards found at startup are opened in parallel
    pub fn with_parallel_shard_open(mut self, parallel: bool) -> Self {
        self.parallel_shard_open = parallel;
        self
    }

    /// Set the compression algorithm
    pub fn with_compression_algorithm(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compression_algorithm = algorithm;
        self
    }

    /// Set the compression level
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Set whether to sync writes to disk immediately
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(Error::config("Data directory must be set"));
        }

        if self.wal_dir.as_os_str().is_empty() {
            return Err(Error::config("WAL directory must be set"));
        }

        if self.dir == self.wal_dir {
            return Err(Error::config(
                "Data and WAL directories must differ"
            ));
        }

        if self.compression_level < 0 || self.compression_level > 9 {
            return Err(Error::config(
                "Compression level must be between 0 and 9"
            ));
        }

        Ok(())
    }

    /// Get the maintenance interval, `None` when maintenance is disabled
    pub fn maintenance_interval(&self) -> Option<Duration> {
        match self.maintenance_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Store Configuration ===\n\n");

        result.push_str("Layout:\n");
        result.push_str(&format!("  Data Directory: {:?}\n", self.dir));
        result.push_str(&format!("  WAL Directory: {:?}\n", self.wal_dir));

        result.push_str("\nIndex Limits:\n");
        if self.max_series_per_database == 0 {
            result.push_str("  Max Series per Database: unlimited\n");
        } else {
            result.push_str(&format!("  Max Series per Database: {}\n", self.max_series_per_database));
        }

        result.push_str("\nLifecycle:\n");
        match self.maintenance_interval() {
            Some(interval) => result.push_str(&format!("  Maintenance Interval: {:?}\n", interval)),
            None => result.push_str("  Maintenance Interval: disabled\n"),
        }
        result.push_str(&format!("  Parallel Shard Open: {}\n", self.parallel_shard_open));

        result.push_str("\nEngine Settings:\n");
        result.push_str(&format!("  Compression Algorithm: {}\n", self.compression_algorithm));
        result.push_str(&format!("  Compression Level: {}\n", self.compression_level));
        result.push_str(&format!("  Sync Writes: {}\n", self.sync_writes));

        result
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();

        assert_eq!(config.dir, PathBuf::from("data"));
        assert_eq!(config.wal_dir, PathBuf::from("wal"));
        assert_eq!(config.max_series_per_database, 1_000_000);
        assert_eq!(config.maintenance_interval(), Some(Duration::from_secs(60)));
        assert!(config.parallel_shard_open);
        assert_eq!(config.compression_level, 3);
        assert!(!config.sync_writes);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_root() {
        let config = StoreConfig::with_root("/var/lib/tsdb/data");
        assert_eq!(config.dir, PathBuf::from("/var/lib/tsdb/data"));
        assert_eq!(config.wal_dir, PathBuf::from("/var/lib/tsdb/wal"));

        let config = StoreConfig::with_root("data");
        assert_eq!(config.wal_dir, PathBuf::from("data/wal"));
    }

    #[test]
    fn test_config_validation() {
        let invalid_configs = vec![
            StoreConfig::new().with_dir(""),
            StoreConfig::new().with_wal_dir(""),
            StoreConfig::new().with_dir("same").with_wal_dir("same"),
            StoreConfig::new().with_compression_level(-1),
            StoreConfig::new().with_compression_level(10),
        ];

        for config in invalid_configs {
            assert!(config.validate().is_err());
        }

        let config = StoreConfig::new().with_maintenance_interval_secs(0);
        assert!(config.validate().is_ok());
        assert_eq!(config.maintenance_interval(), None);
    }

    #[test]
    fn test_compression_algorithm() {
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
        assert_eq!(CompressionAlgorithm::from_str("ZSTD").unwrap(), CompressionAlgorithm::Zstd);
        assert!(CompressionAlgorithm::from_str("snappy").is_err());

        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd] {
            assert_eq!(CompressionAlgorithm::from_tag(algorithm.tag()).unwrap(), algorithm);
        }
        assert!(CompressionAlgorithm::from_tag(9).is_err());
    }

    #[test]
    fn test_json_round_trip() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("store.json");

        let config = StoreConfig::with_root(temp_dir.path().join("data"))
            .with_max_series_per_database(10)
            .with_compression_algorithm(CompressionAlgorithm::Lz4);
        config.to_json_file(&path)?;

        let loaded = StoreConfig::from_json_file(&path)?;
        assert_eq!(loaded.dir, config.dir);
        assert_eq!(loaded.max_series_per_database, 10);
        assert_eq!(loaded.compression_algorithm, CompressionAlgorithm::Lz4);

        // Missing keys fall back to defaults
        std::fs::write(&path, r#"{"dir": "/srv/data", "wal_dir": "/srv/wal"}"#)?;
        let partial = StoreConfig::from_json_file(&path)?;
        assert_eq!(partial.maintenance_interval_secs, 60);

        Ok(())
    }

    #[test]
    fn test_config_pretty_string() {
        let pretty = StoreConfig::new().with_max_series_per_database(0).to_string_pretty();
        assert!(pretty.contains("Layout:"));
        assert!(pretty.contains("Max Series per Database: unlimited"));
        assert!(pretty.contains("Maintenance Interval: 60s"));
    }
}
