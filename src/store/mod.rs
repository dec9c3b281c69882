//! Shard registry
//!
//! The [`Store`] owns every shard on the node and the index of every
//! database those shards belong to. It discovers shards on disk at open,
//! creates and deletes them as the cluster topology changes, routes writes
//! to them and coordinates deletes across shards and indexes.
//!
//! Lock order is registry, then a shard's engine, then a database index.
//! Nothing acquires them in the other direction.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use crossbeam::sync::WaitGroup;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::engine::{EngineFactory, FileEngineFactory};
use crate::error::{Error, Result};
use crate::index::{DatabaseIndex, Measurement, ReconcileStats};
use crate::models::Point;
use crate::shard::{relative_path, shard_path, Shard, ShardId};

mod delete;
mod expand;
mod meta;

pub use meta::filter_show_series_result;

#[derive(Default)]
struct StoreState {
    shards: HashMap<ShardId, Arc<Shard>>,
    indexes: HashMap<String, Arc<DatabaseIndex>>,
    opened: bool,
    closing: Option<Receiver<()>>,
}

impl StoreState {
    /// A store that was never opened counts as closing
    fn is_closing(&self) -> bool {
        match &self.closing {
            Some(rx) => matches!(rx.try_recv(), Err(TryRecvError::Disconnected)),
            None => true,
        }
    }

    fn shards_of(&self, database: &str) -> Vec<Arc<Shard>> {
        let mut shards: Vec<Arc<Shard>> = self
            .shards
            .values()
            .filter(|sh| sh.database() == database)
            .cloned()
            .collect();
        shards.sort_by_key(|sh| sh.id());
        shards
    }

    /// Close and unregister every shard in id order, stopping at the first
    /// failure. Shards not yet closed stay registered.
    fn close_shards(&mut self) -> Result<()> {
        let mut ids: Vec<ShardId> = self.shards.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(shard) = self.shards.get(&id) {
                shard.close()?;
            }
            self.shards.remove(&id);
        }
        Ok(())
    }
}

/// Registry of the shards and database indexes on this node
pub struct Store {
    path: PathBuf,
    config: StoreConfig,
    engine_factory: Arc<dyn EngineFactory>,
    state: Arc<RwLock<StoreState>>,
    closer: Mutex<Option<Sender<()>>>,
    tasks: Mutex<Option<WaitGroup>>,
}

impl Store {
    /// Create a store backed by [`FileEngine`](crate::engine::FileEngine)s
    pub fn new(config: StoreConfig) -> Result<Self> {
        let factory = Arc::new(FileEngineFactory::new(&config));
        Self::with_engine_factory(config, factory)
    }

    /// Create a store whose shards use engines from `factory`
    pub fn with_engine_factory(config: StoreConfig, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: config.dir.clone(),
            config,
            engine_factory: factory,
            state: Arc::new(RwLock::new(StoreState::default())),
            closer: Mutex::new(None),
            tasks: Mutex::new(None),
        })
    }

    /// Root data directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether the store is open and not closing
    pub fn is_open(&self) -> bool {
        let state = self.state.read();
        state.opened && !state.is_closing()
    }

    /// Open the store, loading every shard found below the root directory
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.opened && !state.is_closing() {
            return Ok(());
        }

        // Shards left by a failed close still hold their engines
        state.close_shards()?;

        fs::create_dir_all(&self.path)?;

        let (indexes, shards) = self.load_shards()?;
        let (tx, rx) = channel::unbounded::<()>();

        state.indexes = indexes;
        state.shards = shards;
        state.closing = Some(rx.clone());
        state.opened = true;
        *self.closer.lock() = Some(tx);

        info!(
            target: "tsdb::store",
            path = %self.path.display(),
            databases = state.indexes.len(),
            shards = state.shards.len(),
            "Opened store"
        );
        drop(state);

        self.start_maintenance(rx);
        Ok(())
    }

    /// Scan `<root>/<db>/<rp>/<id>` and open every shard found
    fn load_shards(&self) -> Result<(HashMap<String, Arc<DatabaseIndex>>, HashMap<ShardId, Arc<Shard>>)> {
        let mut indexes = HashMap::new();
        let mut found = Vec::new();

        for db_entry in fs::read_dir(&self.path)? {
            let db_entry = db_entry?;
            if !db_entry.file_type()?.is_dir() {
                warn!(target: "tsdb::store", path = %db_entry.path().display(), "Skipping non-directory in store root");
                continue;
            }
            let database = db_entry.file_name().to_string_lossy().into_owned();
            let index = indexes
                .entry(database.clone())
                .or_insert_with(|| Arc::new(self.new_index(&database)))
                .clone();

            for rp_entry in fs::read_dir(db_entry.path())? {
                let rp_entry = rp_entry?;
                if !rp_entry.file_type()?.is_dir() {
                    warn!(target: "tsdb::store", path = %rp_entry.path().display(), "Skipping non-directory in database dir");
                    continue;
                }
                let retention_policy = rp_entry.file_name().to_string_lossy().into_owned();

                for sh_entry in fs::read_dir(rp_entry.path())? {
                    let sh_entry = sh_entry?;
                    let name = sh_entry.file_name().to_string_lossy().into_owned();
                    let id: ShardId = match name.parse() {
                        Ok(id) => id,
                        Err(_) => {
                            warn!(target: "tsdb::store", path = %sh_entry.path().display(), "Skipping non-numeric shard directory");
                            continue;
                        }
                    };
                    if !sh_entry.file_type()?.is_dir() {
                        warn!(target: "tsdb::store", path = %sh_entry.path().display(), "Skipping non-directory shard entry");
                        continue;
                    }
                    found.push((id, database.clone(), retention_policy.clone(), index.clone()));
                }
            }
        }

        let open = |(id, database, retention_policy, index): (ShardId, String, String, Arc<DatabaseIndex>)| -> Result<Arc<Shard>> {
            let shard = self.build_shard(id, &database, &retention_policy, index)?;
            shard.open()?;
            Ok(Arc::new(shard))
        };
        let results: Vec<Result<Arc<Shard>>> = if self.config.parallel_shard_open {
            found.into_par_iter().map(open).collect()
        } else {
            found.into_iter().map(open).collect()
        };

        let mut shards = HashMap::new();
        let mut first_err = None;
        for result in results {
            match result {
                Ok(shard) => {
                    shards.insert(shard.id(), shard);
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_err {
            for shard in shards.values() {
                if let Err(close_err) = shard.close() {
                    warn!(target: "tsdb::store", shard_id = shard.id(), error = %close_err, "Failed to close shard after aborted open");
                }
            }
            return Err(e);
        }

        Ok((indexes, shards))
    }

    fn new_index(&self, database: &str) -> DatabaseIndex {
        DatabaseIndex::with_max_series(database, self.config.max_series_per_database)
    }

    fn build_shard(
        &self,
        id: ShardId,
        database: &str,
        retention_policy: &str,
        index: Arc<DatabaseIndex>,
    ) -> Result<Shard> {
        let path = shard_path(&self.path, database, retention_policy, id);
        let wal_path = shard_path(&self.config.wal_dir, database, retention_policy, id);
        let engine = self.engine_factory.create(id, &path, &wal_path)?;
        Ok(Shard::new(id, database, retention_policy, path, wal_path, index, engine))
    }

    fn start_maintenance(&self, closing: Receiver<()>) {
        let interval = match self.config.maintenance_interval() {
            Some(interval) => interval,
            None => return,
        };

        let wg = WaitGroup::new();
        let token = wg.clone();
        *self.tasks.lock() = Some(wg);

        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("tsdb-maintenance".to_string())
            .spawn(move || {
                let _token = token;
                let ticker = channel::tick(interval);
                loop {
                    crossbeam::select! {
                        recv(closing) -> _ => break,
                        recv(ticker) -> _ => {
                            let shards: Vec<Arc<Shard>> = state.read().shards.values().cloned().collect();
                            for shard in shards {
                                if let Err(e) = shard.maintain() {
                                    warn!(target: "tsdb::store", shard_id = shard.id(), error = %e, "Shard maintenance failed");
                                }
                            }
                        }
                    }
                }
                debug!(target: "tsdb::store", "Maintenance loop stopped");
            });

        if let Err(e) = spawned {
            error!(target: "tsdb::store", error = %e, "Failed to start maintenance thread");
        }
    }

    /// Close every shard and forget all in-memory state.
    ///
    /// Background work is signalled and waited for first. If a shard fails
    /// to close, the error is returned and the remaining shards stay
    /// registered so the call can be retried.
    pub fn close(&self) -> Result<()> {
        drop(self.closer.lock().take());
        if let Some(wg) = self.tasks.lock().take() {
            wg.wait();
        }

        let mut state = self.state.write();
        state.close_shards()?;

        state.indexes.clear();
        state.opened = false;
        state.closing = None;

        info!(target: "tsdb::store", path = %self.path.display(), "Closed store");
        Ok(())
    }

    /// Create and open a shard. Creating a shard that already exists is a no-op.
    pub fn create_shard(&self, database: &str, retention_policy: &str, id: ShardId) -> Result<()> {
        let mut state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }
        if state.shards.contains_key(&id) {
            return Ok(());
        }

        fs::create_dir_all(self.path.join(database).join(retention_policy))?;
        fs::create_dir_all(shard_path(&self.config.wal_dir, database, retention_policy, id))?;

        let index = match state.indexes.get(database) {
            Some(index) => index.clone(),
            None => Arc::new(self.new_index(database)),
        };

        let shard = self.build_shard(id, database, retention_policy, index.clone())?;
        shard.open()?;

        state.indexes.entry(database.to_string()).or_insert(index);
        state.shards.insert(id, Arc::new(shard));

        info!(
            target: "tsdb::store",
            shard_id = id,
            database = %database,
            retention_policy = %retention_policy,
            "Created shard"
        );
        Ok(())
    }

    /// Look up a shard
    pub fn shard(&self, id: ShardId) -> Option<Arc<Shard>> {
        self.state.read().shards.get(&id).cloned()
    }

    /// Look up several shards; unknown ids are skipped
    pub fn shards(&self, ids: &[ShardId]) -> Vec<Arc<Shard>> {
        let state = self.state.read();
        ids.iter().filter_map(|id| state.shards.get(id).cloned()).collect()
    }

    /// All shards, sorted by id
    pub fn shards_sorted(&self) -> Vec<Arc<Shard>> {
        let mut shards: Vec<Arc<Shard>> = self.state.read().shards.values().cloned().collect();
        shards.sort_by_key(|sh| sh.id());
        shards
    }

    /// Number of shards
    pub fn shard_n(&self) -> usize {
        self.state.read().shards.len()
    }

    /// Ids of all shards, sorted
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.state.read().shards.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Path of a shard relative to the store root
    pub fn shard_relative_path(&self, id: ShardId) -> Result<PathBuf> {
        let shard = self.shard(id).ok_or(Error::ShardNotFound(id))?;
        relative_path(&self.path, shard.path())
    }

    /// Index of a database
    pub fn database_index(&self, name: &str) -> Option<Arc<DatabaseIndex>> {
        self.state.read().indexes.get(name).cloned()
    }

    /// Number of database indexes
    pub fn database_index_n(&self) -> usize {
        self.state.read().indexes.len()
    }

    /// Names of all databases with an index, sorted
    pub fn databases(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.state.read().indexes.keys().cloned().collect();
        names.into_iter().collect()
    }

    /// Look up a measurement in a database's index
    pub fn measurement(&self, database: &str, name: &str) -> Option<Arc<Measurement>> {
        self.database_index(database)?.measurement(name)
    }

    /// Write points to a shard. This is the only way data enters a shard.
    pub fn write_to_shard(&self, id: ShardId, points: &[Point]) -> Result<()> {
        let state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }

        let shard = state.shards.get(&id).ok_or(Error::ShardNotFound(id))?;
        shard.write_points(points)
    }

    /// Bytes used by all shards' data files
    pub fn disk_size(&self) -> Result<u64> {
        let state = self.state.read();
        let mut size = 0;
        for shard in state.shards.values() {
            size += shard.disk_size()?;
        }
        Ok(size)
    }

    /// Stream an incremental backup of a shard
    pub fn backup_shard(&self, id: ShardId, since: DateTime<Utc>, writer: &mut dyn Write) -> Result<()> {
        let shard = self.shard(id).ok_or(Error::ShardNotFound(id))?;
        let relative = relative_path(&self.path, shard.path())?;
        shard.backup(writer, &relative, since)
    }

    /// Rebuild a database's index from the series its shards hold.
    ///
    /// This is the recovery path after a series delete that failed part way
    /// through its shards.
    pub fn reconcile_index(&self, database: &str) -> Result<ReconcileStats> {
        let state = self.state.write();
        let index = state
            .indexes
            .get(database)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;

        let mut keys = HashSet::new();
        for shard in state.shards_of(database) {
            keys.extend(shard.series_keys()?);
        }

        let stats = index.reconcile(keys);
        info!(
            target: "tsdb::store",
            database = %database,
            added = stats.added,
            removed = stats.removed,
            "Reconciled index"
        );
        Ok(stats)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.state.read().opened {
            if let Err(e) = self.close() {
                error!(target: "tsdb::store", error = %e, "Error closing store");
            }
        }
    }
}
