//! Removing shards, databases, retention policies, measurements and series
//!
//! Series deletes run shards first and drop the keys from the index only
//! after every shard succeeded. A shard failure part way through leaves the
//! earlier shards without the series while the index still lists them;
//! [`Store::reconcile_index`] brings the index back in line.
//!
//! Measurement deletes drop the measurement from the index before touching
//! the shards.

use std::fs;
use std::io;
use std::path::Path;

use tracing::info;

use super::{expand, meta, Store, StoreState};
use crate::error::{Error, Result};
use crate::query::{Expr, Source};
use crate::shard::ShardId;

impl Store {
    /// Close a shard and remove its data and WAL directories. Unknown ids
    /// are ignored.
    pub fn delete_shard(&self, id: ShardId) -> Result<()> {
        let mut state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }
        delete_shard(&mut state, id)
    }

    /// Delete every shard of a database, its directories and its index
    pub fn delete_database(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }

        for shard in state.shards_of(name) {
            delete_shard(&mut state, shard.id())?;
        }

        remove_dir_if_exists(&self.path.join(name))?;
        remove_dir_if_exists(&self.config.wal_dir.join(name))?;
        state.indexes.remove(name);

        info!(target: "tsdb::store", database = %name, "Deleted database");
        Ok(())
    }

    /// Delete every shard of a retention policy and its directories
    pub fn delete_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }

        for shard in state.shards_of(database) {
            if shard.retention_policy() == name {
                delete_shard(&mut state, shard.id())?;
            }
        }

        remove_dir_if_exists(&self.path.join(database).join(name))?;
        remove_dir_if_exists(&self.config.wal_dir.join(database).join(name))?;

        info!(target: "tsdb::store", database = %database, retention_policy = %name, "Deleted retention policy");
        Ok(())
    }

    /// Drop a measurement from the index, then from every shard of the
    /// database. An unknown database is a no-op.
    pub fn delete_measurement(&self, database: &str, name: &str) -> Result<()> {
        let state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }

        let index = match state.indexes.get(database) {
            Some(index) => index.clone(),
            None => return Ok(()),
        };
        let measurement = index
            .measurement(name)
            .ok_or_else(|| Error::MeasurementNotFound(name.to_string()))?;

        index.drop_measurement(name);

        let keys = measurement.series_keys();
        for shard in state.shards_of(database) {
            shard.delete_measurement(name, &keys)?;
        }

        info!(target: "tsdb::store", database = %database, measurement = %name, series = keys.len(), "Deleted measurement");
        Ok(())
    }

    /// Delete the series selected by `sources` and a tag-only `condition`.
    ///
    /// Empty `sources` means every measurement of the database. An unknown
    /// database, or sources matching nothing, is a no-op.
    pub fn delete_series(&self, database: &str, sources: &[Source], condition: Option<&Expr>) -> Result<()> {
        let state = self.state.write();
        if state.is_closing() {
            return Err(Error::StoreClosed);
        }

        let index = match state.indexes.get(database) {
            Some(index) => index.clone(),
            None => return Ok(()),
        };

        let expanded = expand::expand_sources(&state, sources)?;
        if !sources.is_empty() && expanded.is_empty() {
            return Ok(());
        }

        let mut keys = Vec::new();
        for m in meta::measurements_from_sources_or_db(&index, &expanded)? {
            let ids = match condition {
                Some(condition) => meta::tag_only_series_ids(&m, condition)?,
                None => m.series_ids().clone(),
            };
            keys.extend(m.series_keys_for(&ids));
        }
        if keys.is_empty() {
            return Ok(());
        }

        for shard in state.shards_of(database) {
            shard.delete_series(&keys)?;
        }
        index.drop_series(&keys);

        info!(target: "tsdb::store", database = %database, series = keys.len(), "Deleted series");
        Ok(())
    }
}

fn delete_shard(state: &mut StoreState, id: ShardId) -> Result<()> {
    let shard = match state.shards.get(&id) {
        Some(shard) => shard.clone(),
        None => return Ok(()),
    };

    shard.close()?;
    remove_dir_if_exists(shard.path())?;
    remove_dir_if_exists(shard.wal_path())?;
    state.shards.remove(&id);

    info!(target: "tsdb::store", shard_id = id, path = %shard.path().display(), "Deleted shard");
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::path(path, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{flaky_store, point, test_store};
    use std::sync::atomic::Ordering;

    #[test_log::test]
    fn test_delete_shard() -> Result<()> {
        let (temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.write_to_shard(1, &[point("cpu", &[], 1.0)])?;

        store.delete_shard(1)?;
        assert!(store.shard(1).is_none());
        assert!(!temp_dir.path().join("data/db0/rp0/1").exists());
        assert!(!temp_dir.path().join("wal/db0/rp0/1").exists());

        // Unknown ids are fine
        store.delete_shard(1)?;
        Ok(())
    }

    #[test]
    fn test_delete_database() -> Result<()> {
        let (temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.create_shard("db0", "rp1", 2)?;
        store.create_shard("db1", "rp0", 3)?;

        store.delete_database("db0")?;
        assert_eq!(store.shard_ids(), vec![3]);
        assert!(store.database_index("db0").is_none());
        assert!(!temp_dir.path().join("data/db0").exists());
        assert!(!temp_dir.path().join("wal/db0").exists());

        // A database with no shards
        store.delete_database("never")?;
        Ok(())
    }

    #[test]
    fn test_delete_retention_policy() -> Result<()> {
        let (temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.create_shard("db0", "rp1", 2)?;

        store.delete_retention_policy("db0", "rp0")?;
        assert_eq!(store.shard_ids(), vec![2]);
        assert!(!temp_dir.path().join("data/db0/rp0").exists());
        assert!(temp_dir.path().join("data/db0/rp1").exists());
        assert!(store.database_index("db0").is_some());
        Ok(())
    }

    #[test]
    fn test_delete_measurement() -> Result<()> {
        let (_temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.create_shard("db0", "rp0", 2)?;
        store.write_to_shard(1, &[point("cpu", &[("host", "a")], 1.0), point("mem", &[], 1.0)])?;
        store.write_to_shard(2, &[point("cpu", &[("host", "b")], 1.0)])?;

        store.delete_measurement("db0", "cpu")?;
        assert!(store.measurement("db0", "cpu").is_none());
        assert_eq!(store.shard(1).unwrap().series_keys()?, vec!["mem"]);
        assert!(store.shard(2).unwrap().series_keys()?.is_empty());

        let err = store.delete_measurement("db0", "cpu").unwrap_err();
        assert!(matches!(err, Error::MeasurementNotFound(_)));

        store.delete_measurement("nope", "cpu")?;
        Ok(())
    }

    #[test]
    fn test_partial_measurement_delete_keeps_index_change() -> Result<()> {
        let (_temp_dir, store, factory) = flaky_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.create_shard("db0", "rp0", 2)?;
        store.write_to_shard(1, &[point("cpu", &[("host", "a")], 1.0)])?;
        store.write_to_shard(2, &[point("cpu", &[("host", "b")], 1.0), point("mem", &[], 1.0)])?;

        factory.switch(2).store(true, Ordering::SeqCst);
        let err = store.delete_measurement("db0", "cpu").unwrap_err();
        assert!(matches!(err, Error::Engine(_)));

        // The index drop is not rolled back
        assert!(store.measurement("db0", "cpu").is_none());
        assert!(store.measurement("db0", "mem").is_some());
        assert!(store.shard(1).unwrap().series_keys()?.is_empty());
        assert_eq!(store.shard(2).unwrap().series_keys()?, vec!["cpu,host=b", "mem"]);

        // Reconcile brings the shard's leftovers back into view
        factory.switch(2).store(false, Ordering::SeqCst);
        assert_eq!(store.reconcile_index("db0")?.added, 1);
        assert!(store.measurement("db0", "cpu").is_some());
        Ok(())
    }

    #[test]
    fn test_delete_series_with_condition() -> Result<()> {
        let (_temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.create_shard("db0", "rp0", 2)?;
        store.write_to_shard(1, &[point("cpu", &[("host", "a")], 1.0), point("cpu", &[("host", "b")], 1.0)])?;
        store.write_to_shard(2, &[point("cpu", &[("host", "a")], 2.0)])?;

        let sources = [Source::measurement("db0", "rp0", "cpu")];
        store.delete_series("db0", &sources, Some(&Expr::tag_eq("host", "a")))?;

        let index = store.database_index("db0").unwrap();
        assert!(index.series("cpu,host=a").is_none());
        assert!(index.series("cpu,host=b").is_some());
        for shard in store.shards_sorted() {
            assert!(!shard.series_keys()?.contains(&"cpu,host=a".to_string()));
        }
        Ok(())
    }

    #[test]
    fn test_delete_series_without_sources_or_condition() -> Result<()> {
        let (_temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.write_to_shard(1, &[point("cpu", &[("host", "a")], 1.0), point("mem", &[], 1.0)])?;

        // Sources that match nothing leave everything in place
        store.delete_series("db0", &[Source::measurement_regex("db0", "rp0", "^disk")?], None)?;
        assert_eq!(store.database_index("db0").unwrap().series_n(), 2);

        store.delete_series("db0", &[], None)?;
        assert_eq!(store.database_index("db0").unwrap().series_n(), 0);
        assert!(store.shard(1).unwrap().series_keys()?.is_empty());

        store.delete_series("nope", &[], None)?;
        Ok(())
    }

    #[test]
    fn test_delete_series_rejects_field_predicates() -> Result<()> {
        let (_temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.write_to_shard(1, &[point("cpu", &[("host", "a")], 1.0)])?;

        let condition = Expr::binary(
            crate::query::BinaryOp::Gt,
            Expr::VarRef("value".into()),
            Expr::Number(0.5),
        );
        let err = store.delete_series("db0", &[], Some(&condition)).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.database_index("db0").unwrap().series_n(), 1);
        Ok(())
    }

    #[test]
    fn test_partial_series_delete_then_reconcile() -> Result<()> {
        let (_temp_dir, store, factory) = flaky_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.create_shard("db0", "rp0", 2)?;
        store.write_to_shard(1, &[point("cpu", &[("host", "a")], 1.0)])?;
        store.write_to_shard(2, &[point("cpu", &[("host", "a")], 1.0), point("cpu", &[("host", "b")], 1.0)])?;

        factory.switch(2).store(true, Ordering::SeqCst);
        assert!(store.delete_series("db0", &[], Some(&Expr::tag_eq("host", "a"))).is_err());

        // Shard 1 lost the series, the index did not
        assert!(store.shard(1).unwrap().series_keys()?.is_empty());
        let index = store.database_index("db0").unwrap();
        assert!(index.series("cpu,host=a").is_some());

        factory.switch(2).store(false, Ordering::SeqCst);
        store.delete_series("db0", &[], Some(&Expr::tag_eq("host", "a")))?;
        assert!(index.series("cpu,host=a").is_none());
        assert_eq!(store.reconcile_index("db0")?.added, 0);
        Ok(())
    }

    #[test]
    fn test_closed_store_rejects_deletes() -> Result<()> {
        let (_temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.close()?;

        assert!(store.delete_shard(1).unwrap_err().is_closed());
        assert!(store.delete_database("db0").unwrap_err().is_closed());
        assert!(store.delete_series("db0", &[], None).unwrap_err().is_closed());
        Ok(())
    }
}
