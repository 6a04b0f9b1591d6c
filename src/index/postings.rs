//! Postings - inverted label index of one block
//!
//! Maps label name → label value → sorted series ordinals.
//!
//! # Example
//! ```ignore
//! // {job="api", code=~"5.."}
//! let candidates = postings.select(&matchers);
//! // candidates = ordinals of series carrying job="api" and a 5xx code
//! ```
//!
//! Built once when a block is opened and never modified afterwards.

use crate::storage::types::{LabelMatcher, Labels, MatchOp};
use std::collections::BTreeMap;

/// Ordinal of a series within its block
pub type SeriesRef = u32;

#[derive(Debug, Default)]
pub struct Postings {
    /// name → value → ordinals (ascending)
    index: BTreeMap<String, BTreeMap<String, Vec<SeriesRef>>>,
    /// every ordinal (ascending)
    all: Vec<SeriesRef>,
}

impl Postings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from label sets enumerated in ordinal order
    pub fn build<'a>(series: impl IntoIterator<Item = &'a Labels>) -> Self {
        let mut postings = Self::new();
        for (ordinal, labels) in series.into_iter().enumerate() {
            postings.add(ordinal as SeriesRef, labels);
        }
        postings
    }

    /// Add a series. Ordinals must be added in ascending order.
    pub fn add(&mut self, series: SeriesRef, labels: &Labels) {
        self.all.push(series);
        for label in labels.iter() {
            self.index
                .entry(label.name.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default()
                .push(series);
        }
    }

    /// Series carrying exactly `name=value`
    pub fn find(&self, name: &str, value: &str) -> &[SeriesRef] {
        self.index
            .get(name)
            .and_then(|values| values.get(value))
            .map(|refs| refs.as_slice())
            .unwrap_or(&[])
    }

    /// Series whose value for the matcher's label is present and accepted
    pub fn find_matching(&self, matcher: &LabelMatcher) -> Vec<SeriesRef> {
        if matcher.op == MatchOp::Equal {
            return self.find(&matcher.name, &matcher.value).to_vec();
        }

        let Some(values) = self.index.get(&matcher.name) else {
            return Vec::new();
        };

        let lists: Vec<&[SeriesRef]> = values
            .iter()
            .filter(|(value, _)| matcher.matches(value))
            .map(|(_, refs)| refs.as_slice())
            .collect();

        union(&lists)
    }

    /// Candidate series for a matcher set.
    ///
    /// Intersects the postings of every matcher that rejects the empty
    /// value; matchers accepting `""` cannot be answered from postings
    /// alone, so callers verify candidates against all matchers.
    pub fn select(&self, matchers: &[LabelMatcher]) -> Vec<SeriesRef> {
        let mut result: Option<Vec<SeriesRef>> = None;

        for matcher in matchers.iter().filter(|m| !m.matches_empty()) {
            let refs = self.find_matching(matcher);
            result = Some(match result {
                Some(existing) => intersect(&existing, &refs),
                None => refs,
            });
            if result.as_ref().is_some_and(|r| r.is_empty()) {
                break;
            }
        }

        result.unwrap_or_else(|| self.all.clone())
    }

    pub fn all(&self) -> &[SeriesRef] {
        &self.all
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(|k| k.as_str())
    }

    pub fn label_values(&self, name: &str) -> impl Iterator<Item = &str> {
        self.index
            .get(name)
            .into_iter()
            .flat_map(|values| values.keys().map(|v| v.as_str()))
    }

    pub fn series_count(&self) -> usize {
        self.all.len()
    }
}

/// Intersection of two ascending lists
fn intersect(a: &[SeriesRef], b: &[SeriesRef]) -> Vec<SeriesRef> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Union of ascending lists, ascending and deduplicated
fn union(lists: &[&[SeriesRef]]) -> Vec<SeriesRef> {
    let mut out: Vec<SeriesRef> = lists.iter().flat_map(|l| l.iter().copied()).collect();
    out.sort_unstable();
    out.dedup();
    out
}
