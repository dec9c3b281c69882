//! Points, series keys and result rows
//!
//! A series key is the measurement name followed by its sorted tags,
//! `cpu,host=a,region=west`. Commas, spaces and (in tags) equals signs are
//! escaped with a backslash.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    /// Name of the value's type, as used in type conflict messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Integer(_) => "integer",
            Self::String(_) => "string",
            Self::Boolean(_) => "boolean",
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

/// A point to be written to a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Create a point with no tags or fields
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The key of the series this point belongs to
    pub fn series_key(&self) -> String {
        make_series_key(&self.measurement, &self.tags)
    }

    /// Check the point can be stored
    pub fn validate(&self) -> Result<()> {
        if self.measurement.is_empty() {
            return Err(Error::invalid_point("missing measurement"));
        }
        if self.fields.is_empty() {
            return Err(Error::invalid_point(format!(
                "point for measurement {} has no fields",
                self.measurement
            )));
        }
        if self.tags.keys().any(|k| k.is_empty()) {
            return Err(Error::invalid_point(format!(
                "point for measurement {} has an empty tag key",
                self.measurement
            )));
        }
        Ok(())
    }
}

/// Build a series key from a measurement name and its tags
pub fn make_series_key(measurement: &str, tags: &BTreeMap<String, String>) -> String {
    let mut key = escape(measurement, &[',', ' ']);
    for (k, v) in tags {
        if v.is_empty() {
            continue;
        }
        key.push(',');
        key.push_str(&escape(k, &[',', '=', ' ']));
        key.push('=');
        key.push_str(&escape(v, &[',', '=', ' ']));
    }
    key
}

/// Split a series key back into its measurement name and tags
pub fn parse_series_key(key: &str) -> Result<(String, BTreeMap<String, String>)> {
    let mut parts = split_unescaped(key, ',').into_iter();
    let measurement = match parts.next() {
        Some(m) if !m.is_empty() => unescape(m),
        _ => return Err(Error::invalid_point(format!("invalid series key: {:?}", key))),
    };

    let mut tags = BTreeMap::new();
    for part in parts {
        let kv = split_unescaped(part, '=');
        if kv.len() != 2 || kv[0].is_empty() {
            return Err(Error::invalid_point(format!("invalid tag in series key: {:?}", key)));
        }
        tags.insert(unescape(kv[0]), unescape(kv[1]));
    }

    Ok((measurement, tags))
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

/// A result row returned by the metadata helpers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub tags: BTreeMap<String, String>,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

impl Row {
    /// Create an empty row with the given name and columns
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            columns,
            values: Vec::new(),
        }
    }

    fn tags_string(&self) -> String {
        self.tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} ({} values)", self.name, self.columns, self.values.len())
    }
}

/// Sort rows by name, then by tag set
pub fn sort_rows(rows: &mut [Row]) {
    rows.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.tags_string().cmp(&b.tags_string()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_series_key() {
        let point = Point::new("cpu", ts())
            .with_tag("region", "west")
            .with_tag("host", "a")
            .with_field("value", 1.0);
        assert_eq!(point.series_key(), "cpu,host=a,region=west");

        let bare = Point::new("mem", ts()).with_field("free", 10i64);
        assert_eq!(bare.series_key(), "mem");
    }

    #[test]
    fn test_series_key_escaping() {
        let point = Point::new("disk io", ts())
            .with_tag("path", "/a,b=c")
            .with_field("value", 1.0);
        let key = point.series_key();
        assert_eq!(key, r"disk\ io,path=/a\,b\=c");

        let (measurement, tags) = parse_series_key(&key).unwrap();
        assert_eq!(measurement, "disk io");
        assert_eq!(tags.get("path").map(String::as_str), Some("/a,b=c"));
    }

    #[test]
    fn test_parse_series_key_rejects_garbage() {
        assert!(parse_series_key("").is_err());
        assert!(parse_series_key("cpu,host").is_err());
        assert!(parse_series_key("cpu,=a").is_err());
    }

    #[test]
    fn test_point_validation() {
        assert!(Point::new("", ts()).with_field("v", 1.0).validate().is_err());
        assert!(Point::new("cpu", ts()).validate().is_err());
        assert!(Point::new("cpu", ts()).with_field("v", true).validate().is_ok());
    }

    #[test]
    fn test_sort_rows() {
        let mut rows = vec![
            Row::new("regionTagValues", vec!["region".into()]),
            Row::new("hostTagValues", vec!["host".into()]),
        ];
        sort_rows(&mut rows);
        assert_eq!(rows[0].name, "hostTagValues");
        assert_eq!(rows[1].name, "regionTagValues");
    }
}
