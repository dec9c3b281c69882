//! Metadata listings answered from the database indexes
//!
//! These back `SHOW FIELD KEYS`, `SHOW TAG VALUES` and `SHOW SERIES`. None of
//! them reads shard data.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use super::{expand, Store};
use crate::error::{Error, Result};
use crate::index::{DatabaseIndex, Measurement, SeriesIds};
use crate::models::{sort_rows, Row};
use crate::query::{
    has_time_expr, Expr, ShowFieldKeysStatement, ShowSeriesStatement, ShowTagValuesStatement, Source,
};

impl Store {
    /// One row per measurement listing its field names
    pub fn execute_show_field_keys_statement(
        &self,
        stmt: &ShowFieldKeysStatement,
        database: &str,
    ) -> Result<Vec<Row>> {
        let measurements = match self.resolve_measurements(database, &stmt.sources)? {
            Some(measurements) => measurements,
            None => return Ok(Vec::new()),
        };

        let rows = measurements
            .iter()
            .map(|m| {
                let mut row = Row::new(m.name(), vec!["fieldKey".to_string()]);
                row.values = m
                    .field_names()
                    .into_iter()
                    .map(|name| vec![Value::String(name)])
                    .collect();
                row
            })
            .collect();
        Ok(rows)
    }

    /// One row per tag key, named `<key>TagValues`, listing the values the
    /// key takes across the selected series
    pub fn execute_show_tag_values_statement(
        &self,
        stmt: &ShowTagValuesStatement,
        database: &str,
    ) -> Result<Vec<Row>> {
        if has_time_expr(stmt.condition.as_ref()) {
            return Err(Error::unsupported("SHOW TAG VALUES doesn't support time in WHERE clause"));
        }

        let measurements = match self.resolve_measurements(database, &stmt.sources)? {
            Some(measurements) => measurements,
            None => return Ok(Vec::new()),
        };

        let mut tag_values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for m in &measurements {
            let ids = match &stmt.condition {
                Some(condition) => {
                    let (ids, _) = m.walk_where_for_series_ids(condition)?;
                    if ids.is_empty() {
                        continue;
                    }
                    ids
                }
                None => m.series_ids().clone(),
            };

            for (key, values) in m.tag_values_by_key_and_series_id(&stmt.tag_keys, &ids) {
                tag_values.entry(key).or_default().extend(values);
            }
        }

        let mut rows: Vec<Row> = tag_values
            .into_iter()
            .map(|(key, values)| {
                let mut row = Row::new(format!("{}TagValues", key), vec![key]);
                row.values = values.into_iter().map(|v| vec![Value::String(v)]).collect();
                row
            })
            .collect();
        sort_rows(&mut rows);
        Ok(rows)
    }

    /// One row per measurement, one value per series: the series key followed
    /// by its tag values. `limit` and `offset` count series, not rows.
    pub fn execute_show_series_statement(&self, stmt: &ShowSeriesStatement, database: &str) -> Result<Vec<Row>> {
        let measurements = match self.resolve_measurements(database, &stmt.sources)? {
            Some(measurements) => measurements,
            None => return Ok(Vec::new()),
        };

        let mut rows = Vec::with_capacity(measurements.len());
        for m in &measurements {
            let ids = match &stmt.condition {
                Some(condition) => tag_only_series_ids(m, condition)?,
                None => m.series_ids().clone(),
            };
            if ids.is_empty() {
                continue;
            }

            let tag_keys = m.tag_keys();
            let mut columns = Vec::with_capacity(tag_keys.len() + 1);
            columns.push("_key".to_string());
            columns.extend(tag_keys.iter().cloned());

            let mut row = Row::new(m.name(), columns);
            for id in ids.iter() {
                let series = match m.series(id) {
                    Some(series) => series,
                    None => continue,
                };
                let mut value = Vec::with_capacity(tag_keys.len() + 1);
                value.push(Value::String(series.key.clone()));
                for key in &tag_keys {
                    value.push(Value::String(series.tags.get(key).cloned().unwrap_or_default()));
                }
                row.values.push(value);
            }
            rows.push(row);
        }

        if stmt.limit > 0 || stmt.offset > 0 {
            let limit = if stmt.limit == 0 { usize::MAX } else { stmt.limit };
            rows = filter_show_series_result(limit, stmt.offset, rows);
        }
        Ok(rows)
    }

    /// Expand the sources and resolve them to measurements. `None` when the
    /// database is unknown or non-empty sources matched nothing.
    fn resolve_measurements(&self, database: &str, sources: &[Source]) -> Result<Option<Vec<Arc<Measurement>>>> {
        let state = self.state.read();
        let index = match state.indexes.get(database) {
            Some(index) => index.clone(),
            None => return Ok(None),
        };

        let expanded = expand::expand_sources(&state, sources)?;
        if !sources.is_empty() && expanded.is_empty() {
            return Ok(None);
        }
        drop(state);

        measurements_from_sources_or_db(&index, &expanded).map(Some)
    }
}

/// Measurements named by `sources`, or every measurement that has series
/// when `sources` is empty, sorted by name. Names the index does not know
/// and regex sources are skipped.
pub(super) fn measurements_from_sources_or_db(
    index: &DatabaseIndex,
    sources: &[Source],
) -> Result<Vec<Arc<Measurement>>> {
    let mut measurements = Vec::new();
    if sources.is_empty() {
        measurements.extend(index.measurements().into_iter().filter(|m| m.has_series()));
    } else {
        for source in sources {
            let measurement = match source {
                Source::Measurement(m) => m,
                _ => return Err(Error::unsupported("identifiers in FROM clause must be measurement names")),
            };
            // Unexpanded regexes name no measurement
            if measurement.regex.is_some() {
                continue;
            }
            if let Some(m) = index.measurement(&measurement.name) {
                measurements.push(m);
            }
        }
    }

    measurements.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(measurements)
}

/// Series selected by a condition that may only reference tags
pub(super) fn tag_only_series_ids(m: &Measurement, condition: &Expr) -> Result<SeriesIds> {
    let (ids, filters) = m.walk_where_for_series_ids(condition)?;
    if filters.values().any(|f| !f.is_true_literal()) {
        return Err(Error::unsupported("field predicates in this clause are unsupported"));
    }
    Ok(ids)
}

/// Paginate rows by their values rather than by rows.
///
/// Values are counted across rows in order; a value is kept while the count
/// is at least `offset` and fewer than `limit` values have been kept. Rows
/// left with no values are dropped, so one row can be split across pages.
pub fn filter_show_series_result(limit: usize, offset: usize, rows: Vec<Row>) -> Vec<Row> {
    let mut filtered = Vec::new();
    let mut count = 0usize;
    for mut row in rows {
        let mut kept = Vec::new();
        for value in row.values.drain(..) {
            if count >= offset && count - offset < limit {
                kept.push(value);
            }
            count += 1;
        }

        if !kept.is_empty() {
            row.values = kept;
            filtered.push(row);
            if count > limit.saturating_add(offset) {
                return filtered;
            }
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::BinaryOp;
    use crate::store::tests::{point, test_store};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn populated_store() -> Result<(tempfile::TempDir, Store)> {
        let (temp_dir, store) = test_store()?;
        store.create_shard("db0", "rp0", 1)?;
        store.write_to_shard(
            1,
            &[
                point("cpu", &[("host", "a"), ("region", "west")], 1.0),
                point("cpu", &[("host", "b"), ("region", "west")], 1.0),
                point("cpu", &[("host", "c"), ("region", "east")], 1.0),
                point("mem", &[("host", "a")], 1.0).with_field("free", 10i64),
            ],
        )?;
        Ok((temp_dir, store))
    }

    fn row(values: &[&str]) -> Row {
        let mut row = Row::new("cpu", vec!["_key".to_string()]);
        row.values = values.iter().map(|v| vec![Value::String(v.to_string())]).collect();
        row
    }

    fn strings(row: &Row) -> Vec<String> {
        row.values
            .iter()
            .map(|v| v[0].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_filter_show_series_result() {
        let rows = vec![row(&["a", "b", "c"]), row(&["d", "e"])];
        let filtered = filter_show_series_result(2, 1, rows);
        assert_eq!(filtered.len(), 1);
        assert_eq!(strings(&filtered[0]), vec!["b", "c"]);

        // A page can straddle rows
        let rows = vec![row(&["a", "b", "c"]), row(&["d", "e"])];
        let filtered = filter_show_series_result(2, 2, rows);
        assert_eq!(filtered.len(), 2);
        assert_eq!(strings(&filtered[0]), vec!["c"]);
        assert_eq!(strings(&filtered[1]), vec!["d"]);
    }

    proptest! {
        #[test]
        fn prop_pagination_matches_flattened_slice(
            sizes in proptest::collection::vec(0usize..5, 0..6),
            limit in 0usize..8,
            offset in 0usize..12,
        ) {
            let mut next = 0usize;
            let rows: Vec<Row> = sizes
                .iter()
                .map(|n| {
                    let names: Vec<String> = (0..*n).map(|i| format!("v{}", next + i)).collect();
                    next += n;
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    row(&refs)
                })
                .collect();
            let flattened: Vec<String> = rows.iter().flat_map(strings).collect();

            let filtered = filter_show_series_result(limit, offset, rows);
            prop_assert!(filtered.iter().all(|r| !r.values.is_empty()));

            let kept: Vec<String> = filtered.iter().flat_map(strings).collect();
            let expected: Vec<String> = flattened.into_iter().skip(offset).take(limit).collect();
            prop_assert_eq!(kept, expected);
        }
    }

    #[test]
    fn test_show_field_keys() -> Result<()> {
        let (_temp_dir, store) = populated_store()?;

        let rows = store.execute_show_field_keys_statement(&ShowFieldKeysStatement::default(), "db0")?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "cpu");
        assert_eq!(rows[0].columns, vec!["fieldKey"]);
        assert_eq!(strings(&rows[1]), vec!["free", "value"]);

        let stmt = ShowFieldKeysStatement {
            sources: vec![Source::measurement_regex("db0", "rp0", "^m")?],
        };
        let rows = store.execute_show_field_keys_statement(&stmt, "db0")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "mem");

        // Sources matching nothing list nothing
        let stmt = ShowFieldKeysStatement {
            sources: vec![Source::measurement_regex("db0", "rp0", "^disk")?],
        };
        assert!(store.execute_show_field_keys_statement(&stmt, "db0")?.is_empty());
        assert!(store.execute_show_field_keys_statement(&ShowFieldKeysStatement::default(), "nope")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_show_tag_values() -> Result<()> {
        let (_temp_dir, store) = populated_store()?;

        let stmt = ShowTagValuesStatement {
            sources: vec![Source::measurement("db0", "rp0", "cpu")],
            tag_keys: vec!["region".to_string(), "host".to_string()],
            condition: Some(Expr::tag_eq("region", "west")),
        };
        let rows = store.execute_show_tag_values_statement(&stmt, "db0")?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "hostTagValues");
        assert_eq!(rows[0].columns, vec!["host"]);
        assert_eq!(strings(&rows[0]), vec!["a", "b"]);
        assert_eq!(rows[1].name, "regionTagValues");
        assert_eq!(strings(&rows[1]), vec!["west"]);

        // Values are unioned across measurements
        let stmt = ShowTagValuesStatement {
            tag_keys: vec!["host".to_string()],
            ..Default::default()
        };
        let rows = store.execute_show_tag_values_statement(&stmt, "db0")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(strings(&rows[0]), vec!["a", "b", "c"]);

        // A condition matching nothing skips the measurement
        let stmt = ShowTagValuesStatement {
            tag_keys: vec!["host".to_string()],
            condition: Some(Expr::tag_eq("region", "north")),
            ..Default::default()
        };
        assert!(store.execute_show_tag_values_statement(&stmt, "db0")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_show_tag_values_rejects_time() -> Result<()> {
        let (_temp_dir, store) = populated_store()?;
        let time = Expr::binary(
            BinaryOp::Gt,
            Expr::VarRef("time".into()),
            Expr::Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        );
        let stmt = ShowTagValuesStatement {
            tag_keys: vec!["host".to_string()],
            condition: Some(Expr::and(Expr::tag_eq("host", "a"), time)),
            ..Default::default()
        };
        let err = store.execute_show_tag_values_statement(&stmt, "db0").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        // Rejected even for an unknown database
        assert!(store.execute_show_tag_values_statement(&stmt, "nope").is_err());
        Ok(())
    }

    #[test]
    fn test_show_series() -> Result<()> {
        let (_temp_dir, store) = populated_store()?;

        let rows = store.execute_show_series_statement(&ShowSeriesStatement::default(), "db0")?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns, vec!["_key", "host", "region"]);
        assert_eq!(strings(&rows[0]), vec!["cpu,host=a,region=west", "cpu,host=b,region=west", "cpu,host=c,region=east"]);
        assert_eq!(rows[0].values[2][2], Value::String("east".into()));

        let stmt = ShowSeriesStatement {
            condition: Some(Expr::tag_eq("host", "a")),
            limit: 1,
            offset: 1,
            ..Default::default()
        };
        let rows = store.execute_show_series_statement(&stmt, "db0")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "mem");
        assert_eq!(strings(&rows[0]), vec!["mem,host=a"]);

        let stmt = ShowSeriesStatement {
            offset: 3,
            ..Default::default()
        };
        let rows = store.execute_show_series_statement(&stmt, "db0")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "mem");
        Ok(())
    }

    #[test]
    fn test_measurements_from_sources_or_db() -> Result<()> {
        let index = DatabaseIndex::new("db0");
        index.register_points(&[point("mem", &[], 1.0), point("cpu", &[], 1.0)])?;

        let all = measurements_from_sources_or_db(&index, &[])?;
        let names: Vec<&str> = all.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["cpu", "mem"]);

        let some = measurements_from_sources_or_db(
            &index,
            &[Source::measurement("db0", "rp0", "mem"), Source::measurement("db0", "rp0", "gone")],
        )?;
        assert_eq!(some.len(), 1);

        let unexpanded = measurements_from_sources_or_db(&index, &[Source::measurement_regex("db0", "rp0", ".*")?])?;
        assert!(unexpanded.is_empty());

        let err = measurements_from_sources_or_db(&index, &[Source::Subquery("SELECT * FROM cpu".into())]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        Ok(())
    }
}
