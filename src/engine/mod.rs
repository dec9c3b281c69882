//! Storage engine capability
//!
//! A shard owns exactly one engine. The store never looks inside it; it only
//! drives the lifecycle and routes writes, deletes and backups through this
//! trait. Engines are created by an [`EngineFactory`] so the store can be run
//! against the bundled [`FileEngine`] or any other implementation.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::Point;

pub mod file;

pub use file::{FileEngine, FileEngineFactory};

/// Storage behind one shard
pub trait Engine: Send {
    /// Open the engine, recovering any persisted state
    fn open(&mut self) -> Result<()>;

    /// Flush and release resources. Closing a closed engine is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Persist a batch of points
    fn write_points(&mut self, points: &[Point]) -> Result<()>;

    /// Stream the files changed after `since` to `writer`. Entry names are
    /// prefixed with `relative`, the shard's path below the store root.
    fn backup(&mut self, writer: &mut dyn Write, relative: &Path, since: DateTime<Utc>) -> Result<()>;

    /// Bytes used by the data files, excluding the write-ahead log
    fn disk_size(&self) -> Result<u64>;

    /// Remove the given series
    fn delete_series(&mut self, keys: &[String]) -> Result<()>;

    /// Remove a measurement, given the keys of its series
    fn delete_measurement(&mut self, name: &str, keys: &[String]) -> Result<()>;

    /// Keys of every series held by the engine
    fn series_keys(&self) -> Result<Vec<String>>;

    /// Periodic housekeeping
    fn maintain(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates the engine for a shard
pub trait EngineFactory: Send + Sync {
    fn create(&self, shard_id: u64, path: &Path, wal_path: &Path) -> Result<Box<dyn Engine>>;
}
