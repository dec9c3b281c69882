//! Shard handles
//!
//! A shard is one directory `<root>/<database>/<retention policy>/<id>` plus
//! its WAL directory, the storage engine working on them, and a shared
//! reference to the index of its database. Its identity never changes after
//! creation; only the engine's open state and contents do.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::Result;
use crate::index::DatabaseIndex;
use crate::models::Point;

mod path;

pub use path::{decode_store_path, relative_path, shard_path};

/// Shard ID type
pub type ShardId = u64;

/// One shard and its engine
pub struct Shard {
    id: ShardId,
    database: String,
    retention_policy: String,
    path: PathBuf,
    wal_path: PathBuf,
    index: Arc<DatabaseIndex>,
    engine: Mutex<Box<dyn Engine>>,
}

impl Shard {
    /// Create a closed shard
    pub fn new(
        id: ShardId,
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        path: PathBuf,
        wal_path: PathBuf,
        index: Arc<DatabaseIndex>,
        engine: Box<dyn Engine>,
    ) -> Self {
        Self {
            id,
            database: database.into(),
            retention_policy: retention_policy.into(),
            path,
            wal_path,
            index,
            engine: Mutex::new(engine),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn retention_policy(&self) -> &str {
        &self.retention_policy
    }

    /// Data directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// WAL directory
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Open the engine
    pub fn open(&self) -> Result<()> {
        self.engine.lock().open()?;
        info!(
            target: "tsdb::shard",
            shard_id = self.id,
            database = %self.database,
            retention_policy = %self.retention_policy,
            "Opened shard"
        );
        Ok(())
    }

    /// Close the engine
    pub fn close(&self) -> Result<()> {
        self.engine.lock().close()?;
        debug!(target: "tsdb::shard", shard_id = self.id, "Closed shard");
        Ok(())
    }

    /// Register the points' series and fields in the database index, then
    /// hand them to the engine.
    ///
    /// Nothing reaches the engine when the index rejects the batch.
    pub fn write_points(&self, points: &[Point]) -> Result<()> {
        let mut engine = self.engine.lock();
        self.index.register_points(points)?;
        engine.write_points(points)
    }

    /// Remove series from the engine
    pub fn delete_series(&self, keys: &[String]) -> Result<()> {
        self.engine.lock().delete_series(keys)
    }

    /// Remove a measurement from the engine
    pub fn delete_measurement(&self, name: &str, keys: &[String]) -> Result<()> {
        self.engine.lock().delete_measurement(name, keys)
    }

    /// Stream an incremental backup
    pub fn backup(&self, writer: &mut dyn Write, relative: &Path, since: DateTime<Utc>) -> Result<()> {
        self.engine.lock().backup(writer, relative, since)
    }

    /// Bytes used by the engine's data files
    pub fn disk_size(&self) -> Result<u64> {
        self.engine.lock().disk_size()
    }

    /// Series keys held by the engine
    pub fn series_keys(&self) -> Result<Vec<String>> {
        self.engine.lock().series_keys()
    }

    /// Run engine housekeeping
    pub fn maintain(&self) -> Result<()> {
        self.engine.lock().maintain()
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("retention_policy", &self.retention_policy)
            .field("path", &self.path)
            .finish()
    }
}
