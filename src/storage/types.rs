//! Core data types for the block store
//!
//! - `Labels`: the sorted label set identifying a series
//! - `Sample`: one (timestamp, value) pair
//! - `TimeRange`: a half-open interval of milliseconds
//! - `LabelMatcher`: a predicate over one label value

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label holding the metric name of a series.
pub const METRIC_NAME: &str = "__name__";

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The identity of a series: label pairs sorted by name, names unique.
///
/// Ordering is lexicographic over the sorted pairs, which gives the
/// deterministic series order used by selection and result formatting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a label set from pairs. Empty values are dropped and a
    /// repeated name keeps its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = Self::new();
        for (name, value) in pairs {
            labels.set(name, value);
        }
        labels
    }

    /// Build from pairs that must already have unique names.
    ///
    /// Returns the duplicated name on failure.
    pub fn try_from_unique(pairs: Vec<(String, String)>) -> Result<Self, String> {
        let mut labels: Vec<Label> = pairs
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| Label { name, value })
            .collect();
        labels.sort();
        for pair in labels.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(pair[0].name.clone());
            }
        }
        Ok(Self(labels))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|label| label.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    /// Value of `name`, or `""` when the label is absent
    pub fn value_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    /// Insert or replace a label. Setting an empty value removes it.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|label| label.name.cmp(&name)) {
            Ok(idx) if value.is_empty() => {
                self.0.remove(idx);
            }
            Ok(idx) => self.0[idx].value = value,
            Err(_) if value.is_empty() => {}
            Err(idx) => self.0.insert(idx, Label { name, value }),
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Ok(idx) = self.0.binary_search_by(|label| label.name.as_str().cmp(name)) {
            self.0.remove(idx);
        }
    }

    pub fn without_metric_name(&self) -> Self {
        Self(
            self.0
                .iter()
                .filter(|label| label.name != METRIC_NAME)
                .cloned()
                .collect(),
        )
    }

    /// Keep only the named labels
    pub fn keep(&self, names: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|label| names.iter().any(|n| *n == label.name))
                .cloned()
                .collect(),
        )
    }

    /// Drop the named labels and the metric name
    pub fn drop_with_name(&self, names: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|label| {
                    label.name != METRIC_NAME && !names.iter().any(|n| *n == label.name)
                })
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|label| (label.name.clone(), label.value.clone()))
            .collect()
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|label| (label.name.clone(), label.value.clone()))
            .collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.metric_name() {
            write!(f, "{}", name)?;
        }
        write!(f, "{{")?;
        let mut first = true;
        for label in self.0.iter().filter(|l| l.name != METRIC_NAME) {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// One sample of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in milliseconds
    pub t: i64,
    pub v: f64,
}

impl Sample {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }
}

/// Time range (half-open interval: [start, end)), in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: i64,
    /// End timestamp (exclusive)
    pub end: i64,
}

impl TimeRange {
    /// Every representable timestamp
    pub const ALL: TimeRange = TimeRange {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start >= end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "TimeRange: start must be less than end");
        Self { start, end }
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The left-open window `(end - width, end]`
    pub fn ending_at(end: i64, width: i64) -> Option<Self> {
        Self::try_new(
            end.saturating_sub(width).saturating_add(1),
            end.saturating_add(1),
        )
    }

    /// The closed interval `[start, end]`
    pub fn closed(start: i64, end: i64) -> Option<Self> {
        Self::try_new(start, end.saturating_add(1))
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// Label matching operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNoMatch,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::RegexMatch => "=~",
            MatchOp::RegexNoMatch => "!~",
        };
        f.write_str(op)
    }
}

/// A predicate over a single label value
///
/// Regex patterns are compiled once, fully anchored.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(
        op: MatchOp,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let value = value.into();
        let regex = match op {
            MatchOp::RegexMatch | MatchOp::RegexNoMatch => {
                Some(Regex::new(&format!("^(?:{})$", value))?)
            }
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self {
            name: name.into(),
            op,
            value,
            regex,
        })
    }

    /// Equality matcher; never fails
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match (self.op, &self.regex) {
            (MatchOp::Equal, _) => self.value == value,
            (MatchOp::NotEqual, _) => self.value != value,
            (MatchOp::RegexMatch, Some(re)) => re.is_match(value),
            (MatchOp::RegexNoMatch, Some(re)) => !re.is_match(value),
            (MatchOp::RegexMatch | MatchOp::RegexNoMatch, None) => false,
        }
    }

    /// Whether a series lacking this label would match
    pub fn matches_empty(&self) -> bool {
        self.matches("")
    }

    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.value_or_empty(&self.name))
    }
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// True when every matcher accepts the label set
pub fn matches_all(matchers: &[LabelMatcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches_labels(labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_unique() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("job", "db")]);

        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job"]);
        assert_eq!(labels.get("job"), Some("db"));
        assert_eq!(labels.metric_name(), Some("up"));
    }

    #[test]
    fn test_labels_empty_value_is_absent() {
        let mut labels = Labels::from_pairs([("a", "1"), ("b", "")]);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels.value_or_empty("b"), "");

        labels.set("a", "");
        assert!(labels.is_empty());
    }

    #[test]
    fn test_try_from_unique_rejects_duplicates() {
        let err = Labels::try_from_unique(vec![
            ("a".to_string(), "1".to_string()),
            ("a".to_string(), "2".to_string()),
        ])
        .unwrap_err();
        assert_eq!(err, "a");
    }

    #[test]
    fn test_labels_ordering() {
        let a = Labels::from_pairs([("__name__", "up"), ("job", "a")]);
        let b = Labels::from_pairs([("__name__", "up"), ("job", "b")]);
        let c = Labels::from_pairs([("__name__", "up")]);

        assert!(c < a);
        assert!(a < b);
    }

    #[test]
    fn test_labels_display() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "api")]);
        assert_eq!(labels.to_string(), r#"up{job="api"}"#);
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(1000, 2000);

        assert!(!range.contains(999));
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
    }

    #[test]
    fn test_time_range_ending_at() {
        let window = TimeRange::ending_at(100, 300).unwrap();
        assert!(window.contains(100));
        assert!(!window.contains(101));
        assert!(!window.contains(-200));
        assert!(window.contains(-199));
    }

    #[test]
    fn test_time_range_overlaps() {
        let range1 = TimeRange::new(1000, 2000);
        let range2 = TimeRange::new(1500, 2500);
        let range3 = TimeRange::new(2000, 3000);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
    }

    #[test]
    fn test_matchers() {
        let labels = Labels::from_pairs([("__name__", "http_requests"), ("code", "500")]);

        assert!(LabelMatcher::equal("code", "500").matches_labels(&labels));
        assert!(LabelMatcher::new(MatchOp::NotEqual, "code", "200")
            .unwrap()
            .matches_labels(&labels));
        assert!(LabelMatcher::new(MatchOp::RegexMatch, "code", "5..")
            .unwrap()
            .matches_labels(&labels));
        assert!(!LabelMatcher::new(MatchOp::RegexNoMatch, "code", "5.*")
            .unwrap()
            .matches_labels(&labels));
    }

    #[test]
    fn test_regex_is_anchored() {
        let m = LabelMatcher::new(MatchOp::RegexMatch, "job", "api").unwrap();
        assert!(m.matches("api"));
        assert!(!m.matches("api-server"));
        assert!(!m.matches("my-api"));
    }

    #[test]
    fn test_missing_label_matches_empty() {
        let labels = Labels::from_pairs([("__name__", "up")]);

        assert!(LabelMatcher::equal("env", "").matches_labels(&labels));
        assert!(!LabelMatcher::new(MatchOp::NotEqual, "env", "")
            .unwrap()
            .matches_labels(&labels));
        assert!(LabelMatcher::new(MatchOp::RegexMatch, "env", ".*")
            .unwrap()
            .matches_empty());
    }

    #[test]
    fn test_invalid_regex() {
        assert!(LabelMatcher::new(MatchOp::RegexMatch, "job", "(").is_err());
    }
}
