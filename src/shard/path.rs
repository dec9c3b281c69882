//! Helpers for the `<root>/<database>/<retention policy>/<shard id>` layout
//!
//! The WAL root uses the same layout, so every helper here works on either.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::shard::ShardId;

/// Path of a shard below a data or WAL root
pub fn shard_path(root: &Path, database: &str, retention_policy: &str, id: ShardId) -> PathBuf {
    root.join(database).join(retention_policy).join(id.to_string())
}

/// Recover the database and retention policy from a shard path.
///
/// The database is the grandparent directory name and the retention policy
/// the parent directory name. Missing components come back empty.
pub fn decode_store_path(path: &Path) -> (String, String) {
    let mut names = path.components().rev().filter_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    });

    // Shard id
    names.next();
    let retention_policy = names.next().unwrap_or_default();
    let database = names.next().unwrap_or_default();
    (database, retention_policy)
}

/// Path of `path` relative to `root`, both resolved against the current
/// directory first when relative
pub fn relative_path(root: &Path, path: &Path) -> Result<PathBuf> {
    let root = absolute(root)?;
    let path = absolute(path)?;
    path.strip_prefix(&root)
        .map(Path::to_path_buf)
        .map_err(|_| Error::path(&path, format!("not below store root {}", root.display())))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
