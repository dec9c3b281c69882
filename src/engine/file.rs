//! File-backed reference engine
//!
//! Points are kept in memory, keyed by series and timestamp, and made
//! durable with an append-only write-ahead log in the shard's WAL directory.
//! On close (and on maintenance, when anything changed) the whole shard is
//! written as a compressed snapshot into the data directory and the log is
//! truncated. Opening loads the snapshot and replays the log on top of it.
//!
//! Log records are framed as:
//!
//! ```text
//! payload length(u32 LE) | crc32 of payload(u32 LE) | bincode payload
//! ```
//!
//! A torn or corrupt tail is dropped on replay.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compression::SnapshotCodec;
use crate::config::StoreConfig;
use crate::engine::{Engine, EngineFactory};
use crate::error::{Error, Result};
use crate::models::{parse_series_key, Point};

const WAL_FILE: &str = "points.wal";
const SNAPSHOT_FILE: &str = "snapshot.dat";
const LOCK_FILE: &str = "LOCK";
const RECORD_HEADER_SIZE: usize = 8;

type SeriesData = BTreeMap<String, BTreeMap<DateTime<Utc>, Point>>;

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    Write(Vec<Point>),
    DeleteSeries(Vec<String>),
    DeleteMeasurement { name: String, keys: Vec<String> },
}

/// Engine persisting a shard as a snapshot plus write-ahead log
pub struct FileEngine {
    id: u64,
    path: PathBuf,
    wal_path: PathBuf,
    codec: SnapshotCodec,
    sync_writes: bool,
    series: SeriesData,
    wal: Option<File>,
    lock: Option<File>,
    dirty: bool,
}

impl FileEngine {
    pub fn new(id: u64, path: &Path, wal_path: &Path, codec: SnapshotCodec, sync_writes: bool) -> Self {
        Self {
            id,
            path: path.to_path_buf(),
            wal_path: wal_path.to_path_buf(),
            codec,
            sync_writes,
            series: SeriesData::new(),
            wal: None,
            lock: None,
            dirty: false,
        }
    }

    /// Whether the engine is open
    pub fn is_open(&self) -> bool {
        self.wal.is_some()
    }

    /// Number of points held
    pub fn point_n(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    /// Points of one series, oldest first
    pub fn points(&self, series_key: &str) -> Vec<Point> {
        self.series
            .get(series_key)
            .map(|points| points.values().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::engine(format!("shard {} engine is closed", self.id)))
        }
    }

    fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::Write(points) => {
                for point in points {
                    self.series
                        .entry(point.series_key())
                        .or_default()
                        .insert(point.timestamp, point);
                }
            }
            WalRecord::DeleteSeries(keys) => {
                for key in &keys {
                    self.series.remove(key);
                }
            }
            WalRecord::DeleteMeasurement { name, keys } => {
                for key in &keys {
                    self.series.remove(key);
                }
                self.series.retain(|key, _| match parse_series_key(key) {
                    Ok((measurement, _)) => measurement != name,
                    Err(_) => true,
                });
            }
        }
    }

    fn append(&mut self, record: &WalRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        frame.write_u32::<LittleEndian>(frame_len(payload.len(), "WAL record")?)?;
        frame.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
        frame.extend_from_slice(&payload);

        let wal = self
            .wal
            .as_mut()
            .ok_or_else(|| Error::engine(format!("shard {} engine is closed", self.id)))?;
        wal.write_all(&frame)?;
        if self.sync_writes {
            wal.sync_data()?;
        }
        Ok(())
    }

    fn load_snapshot(&mut self) -> Result<()> {
        let snapshot_path = self.path.join(SNAPSHOT_FILE);
        if !snapshot_path.exists() {
            return Ok(());
        }

        let raw = fs::read(&snapshot_path)?;
        let data = SnapshotCodec::decode(&raw)?;
        self.series = bincode::deserialize(&data)?;
        Ok(())
    }

    /// Replay the log, returning the byte length of its valid prefix
    fn replay_wal(&mut self, wal_file: &Path) -> Result<u64> {
        let raw = match fs::read(wal_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut cursor = Cursor::new(raw.as_slice());
        let mut valid = 0u64;
        let mut records = 0usize;
        loop {
            let remaining = raw.len() - cursor.position() as usize;
            if remaining == 0 {
                break;
            }
            if remaining < RECORD_HEADER_SIZE {
                warn!(target: "tsdb::engine", shard_id = self.id, bytes = remaining, "Dropping torn WAL record header");
                break;
            }

            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let checksum = cursor.read_u32::<LittleEndian>()?;
            if raw.len() - (cursor.position() as usize) < len {
                warn!(target: "tsdb::engine", shard_id = self.id, "Dropping torn WAL record");
                break;
            }

            let mut payload = vec![0u8; len];
            cursor.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != checksum {
                warn!(target: "tsdb::engine", shard_id = self.id, offset = valid, "WAL checksum mismatch, dropping tail");
                break;
            }

            let record: WalRecord = match bincode::deserialize(&payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!(target: "tsdb::engine", shard_id = self.id, error = %e, "Undecodable WAL record, dropping tail");
                    break;
                }
            };
            self.apply(record);
            records += 1;
            valid = cursor.position();
        }

        if records > 0 {
            debug!(target: "tsdb::engine", shard_id = self.id, records, "Replayed WAL");
        }
        Ok(valid)
    }

    fn snapshot(&mut self) -> Result<()> {
        let data = bincode::serialize(&self.series)?;
        let encoded = self.codec.encode(&data)?;

        let snapshot_path = self.path.join(SNAPSHOT_FILE);
        let tmp_path = self.path.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &snapshot_path)?;

        if let Some(wal) = self.wal.as_mut() {
            wal.set_len(0)?;
        }
        self.dirty = false;

        debug!(
            target: "tsdb::engine",
            shard_id = self.id,
            bytes = encoded.len(),
            algorithm = %self.codec.algorithm(),
            "Wrote snapshot"
        );
        Ok(())
    }
}

impl Engine for FileEngine {
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        fs::create_dir_all(&self.path)?;
        fs::create_dir_all(&self.wal_path)?;

        let lock_path = self.path.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| Error::path(&lock_path, "shard is locked by another engine"))?;

        self.series.clear();
        self.load_snapshot()?;

        let wal_file = self.wal_path.join(WAL_FILE);
        let valid = self.replay_wal(&wal_file)?;

        let wal = OpenOptions::new().create(true).append(true).open(&wal_file)?;
        if wal.metadata()?.len() != valid {
            wal.set_len(valid)?;
        }

        self.dirty = valid > 0;
        self.wal = Some(wal);
        self.lock = Some(lock);

        info!(
            target: "tsdb::engine",
            shard_id = self.id,
            path = %self.path.display(),
            series = self.series.len(),
            "Opened shard engine"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        if self.dirty {
            self.snapshot()?;
        }

        self.wal = None;
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.unlock() {
                warn!(target: "tsdb::engine", shard_id = self.id, error = %e, "Failed to release shard lock");
            }
        }
        self.series.clear();

        debug!(target: "tsdb::engine", shard_id = self.id, "Closed shard engine");
        Ok(())
    }

    fn write_points(&mut self, points: &[Point]) -> Result<()> {
        self.ensure_open()?;
        if points.is_empty() {
            return Ok(());
        }

        let record = WalRecord::Write(points.to_vec());
        self.append(&record)?;
        self.apply(record);
        self.dirty = true;
        Ok(())
    }

    fn backup(&mut self, writer: &mut dyn Write, relative: &Path, since: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;
        if self.dirty {
            self.snapshot()?;
        }

        let mut entries: Vec<_> = fs::read_dir(&self.path)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let metadata = entry.metadata()?;
            if !metadata.is_file() || entry.file_name() == LOCK_FILE {
                continue;
            }

            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified <= since {
                continue;
            }

            let name = relative.join(entry.file_name()).to_string_lossy().replace('\\', "/");
            let data = fs::read(entry.path())?;

            writer.write_u32::<LittleEndian>(frame_len(name.len(), "backup file name")?)?;
            writer.write_all(name.as_bytes())?;
            writer.write_u64::<LittleEndian>(u64::try_from(data.len()).map_err(|_| Error::encoding("backup file too large"))?)?;
            writer.write_all(&data)?;
        }

        Ok(())
    }

    fn disk_size(&self) -> Result<u64> {
        let mut size = 0;
        for entry in fs::read_dir(&self.path)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                size += metadata.len();
            }
        }
        Ok(size)
    }

    fn delete_series(&mut self, keys: &[String]) -> Result<()> {
        self.ensure_open()?;
        let record = WalRecord::DeleteSeries(keys.to_vec());
        self.append(&record)?;
        self.apply(record);
        self.dirty = true;
        Ok(())
    }

    fn delete_measurement(&mut self, name: &str, keys: &[String]) -> Result<()> {
        self.ensure_open()?;
        let record = WalRecord::DeleteMeasurement {
            name: name.to_string(),
            keys: keys.to_vec(),
        };
        self.append(&record)?;
        self.apply(record);
        self.dirty = true;
        Ok(())
    }

    fn series_keys(&self) -> Result<Vec<String>> {
        Ok(self.series.keys().cloned().collect())
    }

    fn maintain(&mut self) -> Result<()> {
        if self.is_open() && self.dirty {
            self.snapshot()?;
        }
        Ok(())
    }
}

/// Creates [`FileEngine`]s configured from a [`StoreConfig`]
#[derive(Debug, Clone)]
pub struct FileEngineFactory {
    codec: SnapshotCodec,
    sync_writes: bool,
}

impl FileEngineFactory {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            codec: SnapshotCodec::new(config.compression_algorithm, config.compression_level),
            sync_writes: config.sync_writes,
        }
    }
}

impl EngineFactory for FileEngineFactory {
    fn create(&self, shard_id: u64, path: &Path, wal_path: &Path) -> Result<Box<dyn Engine>> {
        Ok(Box::new(FileEngine::new(shard_id, path, wal_path, self.codec, self.sync_writes)))
    }
}

/// Length prefix for a frame; lengths that do not fit in a u32 are rejected
fn frame_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::encoding(format!("{} of {} bytes exceeds the frame limit", what, len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionAlgorithm;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn engine(root: &Path) -> FileEngine {
        FileEngine::new(
            1,
            &root.join("data/db0/rp0/1"),
            &root.join("wal/db0/rp0/1"),
            SnapshotCodec::new(CompressionAlgorithm::Lz4, 3),
            false,
        )
    }

    fn cpu(host: &str, minute: u32, value: f64) -> Point {
        Point::new("cpu", Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap())
            .with_tag("host", host)
            .with_field("value", value)
    }

    #[test]
    fn test_write_close_reopen() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut engine = engine(temp_dir.path());
        engine.open()?;
        engine.write_points(&[cpu("a", 0, 1.0), cpu("a", 1, 2.0), cpu("b", 0, 3.0)])?;
        assert_eq!(engine.point_n(), 3);
        engine.close()?;
        assert!(!engine.is_open());

        // The log was folded into the snapshot
        let wal_len = fs::metadata(temp_dir.path().join("wal/db0/rp0/1").join(WAL_FILE))?.len();
        assert_eq!(wal_len, 0);

        let mut engine = self::engine(temp_dir.path());
        engine.open()?;
        assert_eq!(engine.point_n(), 3);
        assert_eq!(engine.series_keys()?, vec!["cpu,host=a", "cpu,host=b"]);
        assert_eq!(engine.points("cpu,host=a").len(), 2);
        Ok(())
    }

    #[test]
    fn test_replay_without_close() -> Result<()> {
        let temp_dir = tempdir()?;
        {
            let mut engine = engine(temp_dir.path());
            engine.open()?;
            engine.write_points(&[cpu("a", 0, 1.0)])?;
            engine.delete_series(&["cpu,host=a".to_string()])?;
            engine.write_points(&[cpu("b", 0, 2.0), cpu("b", 0, 2.5)])?;
            // Dropped without close
        }

        let mut engine = engine(temp_dir.path());
        engine.open()?;
        assert_eq!(engine.series_keys()?, vec!["cpu,host=b"]);
        // Same series and timestamp overwrites
        assert_eq!(engine.point_n(), 1);
        Ok(())
    }

    #[test]
    fn test_torn_wal_tail_is_dropped() -> Result<()> {
        let temp_dir = tempdir()?;
        let wal_file = temp_dir.path().join("wal/db0/rp0/1").join(WAL_FILE);
        {
            let mut engine = engine(temp_dir.path());
            engine.open()?;
            engine.write_points(&[cpu("a", 0, 1.0)])?;
        }

        let intact = fs::metadata(&wal_file)?.len();
        let mut file = OpenOptions::new().append(true).open(&wal_file)?;
        file.write_all(&[42, 0, 0, 0, 1, 2])?;
        drop(file);

        let mut engine = engine(temp_dir.path());
        engine.open()?;
        assert_eq!(engine.point_n(), 1);
        assert_eq!(fs::metadata(&wal_file)?.len(), intact);

        // New writes land after the valid prefix
        engine.write_points(&[cpu("c", 0, 1.0)])?;
        drop(engine);
        let mut engine = self::engine(temp_dir.path());
        engine.open()?;
        assert_eq!(engine.point_n(), 2);
        Ok(())
    }

    #[test]
    fn test_exclusive_lock() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut first = engine(temp_dir.path());
        first.open()?;

        let mut second = engine(temp_dir.path());
        assert!(second.open().unwrap_err().is_io_error());

        first.close()?;
        second.open()?;
        Ok(())
    }

    #[test]
    fn test_delete_measurement() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut engine = engine(temp_dir.path());
        engine.open()?;

        let mem = Point::new("mem", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).with_field("free", 1i64);
        engine.write_points(&[cpu("a", 0, 1.0), cpu("b", 0, 1.0), mem])?;
        engine.delete_measurement("cpu", &["cpu,host=a".to_string()])?;

        assert_eq!(engine.series_keys()?, vec!["mem"]);
        Ok(())
    }

    #[test]
    fn test_closed_engine_rejects_writes() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine(temp_dir.path());
        assert!(matches!(engine.write_points(&[cpu("a", 0, 1.0)]), Err(Error::Engine(_))));
        assert!(engine.close().is_ok());
    }

    #[test]
    fn test_disk_size_and_maintain() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut engine = engine(temp_dir.path());
        engine.open()?;
        engine.write_points(&[cpu("a", 0, 1.0)])?;

        // Only the log has grown so far
        assert_eq!(engine.disk_size()?, 0);

        engine.maintain()?;
        assert!(engine.disk_size()? > 0);
        let wal_len = fs::metadata(temp_dir.path().join("wal/db0/rp0/1").join(WAL_FILE))?.len();
        assert_eq!(wal_len, 0);
        Ok(())
    }

    #[test]
    fn test_backup_since() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut engine = engine(temp_dir.path());
        engine.open()?;
        engine.write_points(&[cpu("a", 0, 1.0)])?;

        let relative = Path::new("db0/rp0/1");
        let mut out = Vec::new();
        engine.backup(&mut out, relative, Utc.timestamp_opt(0, 0).unwrap())?;

        let mut cursor = Cursor::new(out.as_slice());
        let name_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name)?;
        assert_eq!(String::from_utf8(name).unwrap(), "db0/rp0/1/snapshot.dat");
        let data_len = cursor.read_u64::<LittleEndian>()?;
        assert!(data_len > 0);

        let mut out = Vec::new();
        engine.backup(&mut out, relative, Utc::now() + Duration::hours(1))?;
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn test_factory() -> Result<()> {
        let temp_dir = tempdir()?;
        let config = StoreConfig::with_root(temp_dir.path().join("data"));
        let factory = FileEngineFactory::new(&config);
        let mut engine = factory.create(9, &temp_dir.path().join("data/db/rp/9"), &temp_dir.path().join("wal/db/rp/9"))?;
        engine.open()?;
        engine.write_points(&[cpu("a", 0, 1.0)])?;
        assert_eq!(engine.series_keys()?, vec!["cpu,host=a"]);
        engine.close()?;
        Ok(())
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_frames_are_rejected() {
        assert_eq!(frame_len(42, "WAL record").unwrap(), 42);
        assert_eq!(frame_len(u32::MAX as usize, "WAL record").unwrap(), u32::MAX);

        let err = frame_len(u32::MAX as usize + 1, "WAL record").unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(err.to_string().contains("4294967296 bytes"));
    }
}
