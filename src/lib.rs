//! Shard and index management for a sharded time-series store
//!
//! A [`Store`] owns every shard under a root directory laid out as
//! `<root>/<database>/<retention policy>/<shard id>`, plus one in-memory
//! [`DatabaseIndex`] per database shared by all of that database's shards.
//! It discovers and opens shards at startup, routes writes, deletes shards,
//! databases, retention policies, measurements and series, expands regex
//! sources, and answers metadata listings (`SHOW FIELD KEYS`,
//! `SHOW TAG VALUES`, `SHOW SERIES`) from the indexes.
//!
//! ```no_run
//! use cocoon_tsdb::{Point, Store, StoreConfig};
//! use chrono::Utc;
//!
//! # fn main() -> cocoon_tsdb::Result<()> {
//! let store = Store::new(StoreConfig::with_root("/var/lib/tsdb/data"))?;
//! store.open()?;
//! store.create_shard("telemetry", "autogen", 1)?;
//! store.write_to_shard(1, &[Point::new("cpu", Utc::now()).with_tag("host", "a").with_field("value", 0.5)])?;
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod models;
pub mod query;
pub mod shard;
pub mod store;

pub use config::{CompressionAlgorithm, StoreConfig};
pub use engine::{Engine, EngineFactory, FileEngine, FileEngineFactory};
pub use error::{is_retryable, Error, Result};
pub use index::{DatabaseIndex, Measurement};
pub use models::{FieldValue, Point, Row};
pub use query::{Expr, Source};
pub use shard::{decode_store_path, Shard, ShardId};
pub use store::{filter_show_series_result, Store};
