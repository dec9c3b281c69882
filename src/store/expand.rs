//! Regex source expansion

use std::collections::BTreeMap;

use super::{Store, StoreState};
use crate::error::{Error, Result};
use crate::query::Source;

impl Store {
    /// Replace regex measurement sources with the literal measurements they
    /// match.
    ///
    /// The result is deduplicated and sorted by the sources' string form, so
    /// the same input always expands to the same list. A regex against an
    /// unknown database expands the whole call to nothing.
    pub fn expand_sources(&self, sources: &[Source]) -> Result<Vec<Source>> {
        let state = self.state.read();
        expand_sources(&state, sources)
    }
}

pub(super) fn expand_sources(state: &StoreState, sources: &[Source]) -> Result<Vec<Source>> {
    let mut set: BTreeMap<String, Source> = BTreeMap::new();

    for source in sources {
        let measurement = match source {
            Source::Measurement(m) => m,
            other => return Err(Error::UnsupportedSource(other.to_string())),
        };

        let re = match &measurement.regex {
            Some(re) => re,
            None => {
                set.insert(source.to_string(), source.clone());
                continue;
            }
        };

        let index = match state.indexes.get(&measurement.database) {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };

        for m in index.measurements_by_regex(re) {
            let expanded = Source::Measurement(measurement.with_name(m.name()));
            set.insert(expanded.to_string(), expanded);
        }
    }

    Ok(set.into_values().collect())
}
