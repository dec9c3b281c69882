//! Per-database measurement and series index
//!
//! A [`DatabaseIndex`] is shared by every shard of one database. It maps
//! measurement names to [`Measurement`]s, each of which tracks its series,
//! an inverted tag index (tag key -> tag value -> series ids) used to answer
//! WHERE clauses, and the types of the fields written to it.
//!
//! Dropping series or measurements here only touches the index. Removing the
//! underlying data from the shards is the store's job.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{parse_series_key, Point};
use crate::query::{BinaryOp, Expr};

/// Series identifier, unique within one database index
pub type SeriesId = u64;

/// Residual per-series filter expressions left after walking a condition
/// over the tag index. A series without an entry matched unconditionally.
pub type FilterExprs = HashMap<SeriesId, Expr>;

/// A sorted, deduplicated set of series ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesIds(Vec<SeriesId>);

impl SeriesIds {
    /// Create an empty set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Number of ids
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the set contains `id`
    pub fn contains(&self, id: SeriesId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Iterate ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = SeriesId> + '_ {
        self.0.iter().copied()
    }

    /// Ids present in both sets
    pub fn intersect(&self, other: &Self) -> Self {
        let (mut i, mut j) = (0, 0);
        let mut out = Vec::with_capacity(self.len().min(other.len()));
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(self.0[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        Self(out)
    }

    /// Ids present in either set
    pub fn union(&self, other: &Self) -> Self {
        let (mut i, mut j) = (0, 0);
        let mut out = Vec::with_capacity(self.len() + other.len());
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => {
                    out.push(self.0[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(other.0[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(self.0[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.0[i..]);
        out.extend_from_slice(&other.0[j..]);
        Self(out)
    }

    /// Ids in this set that are not in `other`
    pub fn reject(&self, other: &Self) -> Self {
        Self(self.0.iter().copied().filter(|id| !other.contains(*id)).collect())
    }

    fn insert(&mut self, id: SeriesId) {
        if let Err(pos) = self.0.binary_search(&id) {
            self.0.insert(pos, id);
        }
    }

    fn remove(&mut self, id: SeriesId) {
        if let Ok(pos) = self.0.binary_search(&id) {
            self.0.remove(pos);
        }
    }
}

impl FromIterator<SeriesId> for SeriesIds {
    fn from_iter<I: IntoIterator<Item = SeriesId>>(iter: I) -> Self {
        let mut ids: Vec<SeriesId> = iter.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }
}

/// One series: a measurement name plus a tag set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub id: SeriesId,
    pub key: String,
    pub tags: BTreeMap<String, String>,
}

/// Index entry for one measurement
#[derive(Debug, Clone)]
pub struct Measurement {
    name: String,
    series_by_id: HashMap<SeriesId, Series>,
    series_ids: SeriesIds,
    series_by_tag_key_value: HashMap<String, HashMap<String, SeriesIds>>,
    fields: BTreeMap<String, &'static str>,
}

impl Measurement {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            series_by_id: HashMap::new(),
            series_ids: SeriesIds::new(),
            series_by_tag_key_value: HashMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Measurement name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All series ids of the measurement
    pub fn series_ids(&self) -> &SeriesIds {
        &self.series_ids
    }

    /// Whether any series remain
    pub fn has_series(&self) -> bool {
        !self.series_ids.is_empty()
    }

    /// Look up one series
    pub fn series(&self, id: SeriesId) -> Option<&Series> {
        self.series_by_id.get(&id)
    }

    /// Keys of every series, in id order
    pub fn series_keys(&self) -> Vec<String> {
        self.series_keys_for(&self.series_ids)
    }

    /// Keys of the given series, in id order; unknown ids are skipped
    pub fn series_keys_for(&self, ids: &SeriesIds) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.series_by_id.get(&id))
            .map(|s| s.key.clone())
            .collect()
    }

    /// Field names, sorted
    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// Whether a field with this name has been written
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Type name recorded for a field
    pub fn field_type(&self, name: &str) -> Option<&'static str> {
        self.fields.get(name).copied()
    }

    /// Tag keys, sorted
    pub fn tag_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.series_by_tag_key_value.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve a condition to the series it selects.
    ///
    /// Tag comparisons are answered from the tag index. Comparisons against
    /// fields cannot be, so they select every series and are returned as
    /// residual filters keyed by series id. Time comparisons select every
    /// series with no residual filter.
    pub fn walk_where_for_series_ids(&self, expr: &Expr) -> Result<(SeriesIds, FilterExprs)> {
        match expr {
            Expr::Binary { op, lhs, rhs } if op.is_comparison() => {
                let (ids, filter) = self.ids_for_expr(*op, lhs, rhs)?;
                if ids.is_empty() {
                    return Ok((ids, FilterExprs::new()));
                }

                let filters = match filter {
                    Some(f) if !f.is_true_literal() => ids.iter().map(|id| (id, f.clone())).collect(),
                    _ => FilterExprs::new(),
                };
                Ok((ids, filters))
            }
            Expr::Binary { op, lhs, rhs } => {
                let (lids, lfilters) = self.walk_where_for_series_ids(lhs)?;
                let (rids, rfilters) = self.walk_where_for_series_ids(rhs)?;
                if *op == BinaryOp::And {
                    Ok(intersect_series_filters(&lids, &rids, &lfilters, &rfilters))
                } else {
                    Ok(union_series_filters(&lids, &rids, &lfilters, &rfilters))
                }
            }
            Expr::Paren(inner) => self.walk_where_for_series_ids(inner),
            _ => Ok((self.series_ids.clone(), FilterExprs::new())),
        }
    }

    fn ids_for_expr(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<(SeriesIds, Option<Expr>)> {
        let (name, value) = match (lhs, rhs) {
            (Expr::VarRef(name), value) => (name, value),
            (value, Expr::VarRef(name)) => (name, value),
            _ => {
                return Err(Error::invalid_expression(format!("{} {} {}", lhs, op, rhs)));
            }
        };

        if matches!(value, Expr::Time(_)) || name.eq_ignore_ascii_case("time") {
            return Ok((self.series_ids.clone(), Some(Expr::Boolean(true))));
        }

        if self.has_field(name) {
            return Ok((self.series_ids.clone(), Some(Expr::binary(op, lhs.clone(), rhs.clone()))));
        }

        let empty = HashMap::new();
        let tag_vals = self.series_by_tag_key_value.get(name.as_str()).unwrap_or(&empty);

        // Series without the tag compare as if it were the empty string
        let missing = || {
            let tagged = tag_vals.values().fold(SeriesIds::new(), |acc, ids| acc.union(ids));
            self.series_ids.reject(&tagged)
        };

        let ids = match value {
            Expr::String(s) => {
                let mut matching = tag_vals.get(s.as_str()).cloned().unwrap_or_default();
                if s.is_empty() {
                    matching = matching.union(&missing());
                }
                match op {
                    BinaryOp::Eq => matching,
                    BinaryOp::Neq => self.series_ids.reject(&matching),
                    _ => SeriesIds::new(),
                }
            }
            Expr::Regex(re) => {
                let mut matching = SeriesIds::new();
                for (tag_value, series) in tag_vals {
                    if re.is_match(tag_value) {
                        matching = matching.union(series);
                    }
                }
                if re.is_match("") {
                    matching = matching.union(&missing());
                }
                match op {
                    BinaryOp::EqRegex => matching,
                    BinaryOp::NeqRegex => self.series_ids.reject(&matching),
                    _ => SeriesIds::new(),
                }
            }
            Expr::VarRef(other) => {
                let mut ids = match op {
                    BinaryOp::Neq => self.series_ids.clone(),
                    _ => SeriesIds::new(),
                };
                let other_vals = self.series_by_tag_key_value.get(other.as_str()).unwrap_or(&empty);
                for (tag_value, series) in tag_vals {
                    let same = match other_vals.get(tag_value) {
                        Some(other_series) => series.intersect(other_series),
                        None => continue,
                    };
                    match op {
                        BinaryOp::Eq => ids = ids.union(&same),
                        BinaryOp::Neq => ids = ids.reject(&same),
                        _ => {}
                    }
                }
                ids
            }
            _ => {
                if matches!(op, BinaryOp::Neq | BinaryOp::NeqRegex) {
                    self.series_ids.clone()
                } else {
                    return Ok((SeriesIds::new(), None));
                }
            }
        };

        Ok((ids, Some(Expr::Boolean(true))))
    }

    /// Values of the given tag keys across the given series. An empty key
    /// list means every tag key of the measurement.
    pub fn tag_values_by_key_and_series_id(
        &self,
        tag_keys: &[String],
        ids: &SeriesIds,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let keys: Vec<String> = if tag_keys.is_empty() {
            self.tag_keys()
        } else {
            tag_keys.to_vec()
        };

        let mut values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for id in ids.iter() {
            let series = match self.series_by_id.get(&id) {
                Some(s) => s,
                None => continue,
            };
            for key in &keys {
                match series.tags.get(key) {
                    Some(v) if !v.is_empty() => {
                        values.entry(key.clone()).or_default().insert(v.clone());
                    }
                    _ => {}
                }
            }
        }
        values
    }

    fn add_series(&mut self, series: Series) {
        for (k, v) in &series.tags {
            self.series_by_tag_key_value
                .entry(k.clone())
                .or_default()
                .entry(v.clone())
                .or_default()
                .insert(series.id);
        }
        self.series_ids.insert(series.id);
        self.series_by_id.insert(series.id, series);
    }

    fn drop_series(&mut self, id: SeriesId) {
        let series = match self.series_by_id.remove(&id) {
            Some(s) => s,
            None => return,
        };
        self.series_ids.remove(id);

        for (k, v) in &series.tags {
            let mut key_empty = false;
            if let Some(values) = self.series_by_tag_key_value.get_mut(k) {
                let mut value_empty = false;
                if let Some(ids) = values.get_mut(v) {
                    ids.remove(id);
                    value_empty = ids.is_empty();
                }
                if value_empty {
                    values.remove(v);
                }
                key_empty = values.is_empty();
            }
            if key_empty {
                self.series_by_tag_key_value.remove(k);
            }
        }
    }
}

fn intersect_series_filters(
    lids: &SeriesIds,
    rids: &SeriesIds,
    lfilters: &FilterExprs,
    rfilters: &FilterExprs,
) -> (SeriesIds, FilterExprs) {
    let ids = lids.intersect(rids);
    let mut filters = FilterExprs::new();
    for id in ids.iter() {
        let filter = match (lfilters.get(&id), rfilters.get(&id)) {
            (Some(l), Some(r)) => Some(Expr::and(l.clone(), r.clone())),
            (Some(l), None) => Some(l.clone()),
            (None, Some(r)) => Some(r.clone()),
            (None, None) => None,
        };
        if let Some(f) = filter {
            filters.insert(id, f);
        }
    }
    (ids, filters)
}

fn union_series_filters(
    lids: &SeriesIds,
    rids: &SeriesIds,
    lfilters: &FilterExprs,
    rfilters: &FilterExprs,
) -> (SeriesIds, FilterExprs) {
    let ids = lids.union(rids);
    let mut filters = FilterExprs::new();
    for id in ids.iter() {
        // A side that matched the id without a filter matched it outright.
        let l = lids.contains(id).then(|| lfilters.get(&id));
        let r = rids.contains(id).then(|| rfilters.get(&id));
        let filter = match (l, r) {
            (Some(None), _) | (_, Some(None)) => None,
            (Some(Some(l)), Some(Some(r))) => Some(Expr::or(l.clone(), r.clone())),
            (Some(Some(f)), None) | (None, Some(Some(f))) => Some(f.clone()),
            (None, None) => None,
        };
        if let Some(f) = filter {
            filters.insert(id, f);
        }
    }
    (ids, filters)
}

/// Counts reported by [`DatabaseIndex::reconcile`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Series present in shards but missing from the index
    pub added: usize,
    /// Series in the index that no shard holds
    pub removed: usize,
}

#[derive(Debug, Default)]
struct IndexInner {
    measurements: HashMap<String, Arc<Measurement>>,
    series: HashMap<String, (String, SeriesId)>,
    last_id: SeriesId,
}

impl IndexInner {
    fn create_series(&mut self, measurement: &str, key: String, tags: BTreeMap<String, String>) -> SeriesId {
        if let Some((_, id)) = self.series.get(&key) {
            return *id;
        }

        self.last_id += 1;
        let id = self.last_id;
        let m = self
            .measurements
            .entry(measurement.to_string())
            .or_insert_with(|| Arc::new(Measurement::new(measurement)));
        Arc::make_mut(m).add_series(Series {
            id,
            key: key.clone(),
            tags,
        });
        self.series.insert(key, (measurement.to_string(), id));
        id
    }

    fn drop_series_key(&mut self, key: &str) -> bool {
        let (measurement, id) = match self.series.remove(key) {
            Some(entry) => entry,
            None => return false,
        };

        let mut now_empty = false;
        if let Some(m) = self.measurements.get_mut(&measurement) {
            let m = Arc::make_mut(m);
            m.drop_series(id);
            now_empty = !m.has_series();
        }
        if now_empty {
            self.measurements.remove(&measurement);
        }
        true
    }
}

/// In-memory catalog of the measurements and series of one database
#[derive(Debug)]
pub struct DatabaseIndex {
    name: String,
    max_series: usize,
    inner: RwLock<IndexInner>,
}

impl DatabaseIndex {
    /// Create an empty index with no series limit
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_max_series(name, 0)
    }

    /// Create an empty index holding at most `max_series` series (0 = no limit)
    pub fn with_max_series(name: impl Into<String>, max_series: usize) -> Self {
        Self {
            name: name.into(),
            max_series,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a measurement
    pub fn measurement(&self, name: &str) -> Option<Arc<Measurement>> {
        self.inner.read().measurements.get(name).cloned()
    }

    /// All measurements, sorted by name
    pub fn measurements(&self) -> Vec<Arc<Measurement>> {
        let mut all: Vec<Arc<Measurement>> = self.inner.read().measurements.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Measurements whose name matches the pattern, in no particular order
    pub fn measurements_by_regex(&self, re: &Regex) -> Vec<Arc<Measurement>> {
        self.inner
            .read()
            .measurements
            .values()
            .filter(|m| re.is_match(&m.name))
            .cloned()
            .collect()
    }

    /// Number of measurements
    pub fn measurement_n(&self) -> usize {
        self.inner.read().measurements.len()
    }

    /// Number of series
    pub fn series_n(&self) -> usize {
        self.inner.read().series.len()
    }

    /// Look up a series by key
    pub fn series(&self, key: &str) -> Option<Series> {
        let inner = self.inner.read();
        let (measurement, id) = inner.series.get(key)?;
        inner.measurements.get(measurement)?.series(*id).cloned()
    }

    /// Every series key in the index, sorted
    pub fn series_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().series.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Register the series and field types carried by a batch of points.
    ///
    /// The whole batch is checked before anything is recorded, so a field
    /// type conflict or an exhausted series limit leaves the index unchanged.
    pub fn register_points(&self, points: &[Point]) -> Result<()> {
        let mut inner = self.inner.write();

        let mut pending_fields: HashMap<(&str, &str), &'static str> = HashMap::new();
        let mut new_keys: HashSet<String> = HashSet::new();
        for point in points {
            point.validate()?;

            let measurement = inner.measurements.get(&point.measurement);
            for (field, value) in &point.fields {
                let requested = value.type_name();
                let existing = measurement
                    .and_then(|m| m.field_type(field))
                    .or_else(|| pending_fields.get(&(point.measurement.as_str(), field.as_str())).copied());
                match existing {
                    Some(existing) if existing != requested => {
                        return Err(Error::FieldTypeConflict {
                            measurement: point.measurement.clone(),
                            field: field.clone(),
                            existing,
                            requested,
                        });
                    }
                    Some(_) => {}
                    None => {
                        pending_fields.insert((point.measurement.as_str(), field.as_str()), requested);
                    }
                }
            }

            let key = point.series_key();
            if !inner.series.contains_key(&key) {
                new_keys.insert(key);
            }
        }

        if self.max_series > 0 && inner.series.len() + new_keys.len() > self.max_series {
            return Err(Error::MaxSeriesExceeded {
                database: self.name.clone(),
                limit: self.max_series,
            });
        }

        for point in points {
            let tags: BTreeMap<String, String> = point
                .tags
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            inner.create_series(&point.measurement, point.series_key(), tags);
        }
        for ((measurement, field), field_type) in pending_fields {
            if let Some(m) = inner.measurements.get_mut(measurement) {
                Arc::make_mut(m).fields.insert(field.to_string(), field_type);
            }
        }

        Ok(())
    }

    /// Remove a measurement and all of its series from the index
    pub fn drop_measurement(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let m = match inner.measurements.remove(name) {
            Some(m) => m,
            None => return false,
        };
        for key in m.series_keys() {
            inner.series.remove(&key);
        }
        debug!(target: "tsdb::index", database = %self.name, measurement = name, "Dropped measurement");
        true
    }

    /// Remove series by key; measurements left without series are removed
    pub fn drop_series(&self, keys: &[String]) -> usize {
        let mut inner = self.inner.write();
        keys.iter().filter(|key| inner.drop_series_key(key)).count()
    }

    /// Make the index hold exactly the given series keys.
    ///
    /// Series already indexed keep their ids and their measurement keeps its
    /// field types. Keys that fail to parse are skipped.
    pub fn reconcile<I>(&self, keys: I) -> ReconcileStats
    where
        I: IntoIterator<Item = String>,
    {
        let wanted: HashSet<String> = keys.into_iter().collect();
        let mut inner = self.inner.write();
        let mut stats = ReconcileStats::default();

        let stale: Vec<String> = inner
            .series
            .keys()
            .filter(|k| !wanted.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            if inner.drop_series_key(&key) {
                stats.removed += 1;
            }
        }

        for key in wanted {
            if inner.series.contains_key(&key) {
                continue;
            }
            match parse_series_key(&key) {
                Ok((measurement, tags)) => {
                    inner.create_series(&measurement, key, tags);
                    stats.added += 1;
                }
                Err(e) => {
                    debug!(target: "tsdb::index", database = %self.name, error = %e, "Skipping unparsable series key");
                }
            }
        }

        stats
    }
}
