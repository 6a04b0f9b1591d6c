//! Aggregation operators over instant vectors

use crate::query::ast::{AggregateOp, Grouping};
use crate::query::functions::sum_kahan;
use crate::query::value::VectorElement;
use crate::storage::Labels;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Labels that identify the output group of an element
pub fn group_key(labels: &Labels, grouping: &Grouping) -> Labels {
    match grouping {
        Grouping::By(names) => labels.keep(names),
        Grouping::Without(names) => labels.drop_with_name(names),
    }
}

/// Aggregate one instant vector evaluated at `t`.
///
/// `param` is the already evaluated scalar for `topk`, `bottomk` and
/// `quantile`. Zero input elements produce zero output elements.
pub fn aggregate(
    op: AggregateOp,
    grouping: &Grouping,
    param: Option<f64>,
    input: Vec<VectorElement>,
    t: i64,
) -> Vec<VectorElement> {
    let mut groups: BTreeMap<Labels, Vec<VectorElement>> = BTreeMap::new();
    for element in input {
        groups
            .entry(group_key(&element.labels, grouping))
            .or_default()
            .push(element);
    }

    let mut output = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        match op {
            AggregateOp::Topk | AggregateOp::Bottomk => {
                let k = param.unwrap_or(0.0);
                output.extend(select_k(members, k, op == AggregateOp::Topk, t));
            }
            _ => {
                let values: Vec<f64> = members.iter().map(|e| e.value).collect();
                let value = reduce(op, &values, param);
                output.push(VectorElement::new(key, value, t));
            }
        }
    }
    output
}

fn reduce(op: AggregateOp, values: &[f64], param: Option<f64>) -> f64 {
    let count = values.len() as f64;
    match op {
        AggregateOp::Sum => sum_kahan(values.iter().copied()),
        AggregateOp::Avg => sum_kahan(values.iter().copied()) / count,
        AggregateOp::Min => values.iter().fold(f64::NAN, |min, &v| {
            if v < min || min.is_nan() {
                v
            } else {
                min
            }
        }),
        AggregateOp::Max => values.iter().fold(f64::NAN, |max, &v| {
            if v > max || max.is_nan() {
                v
            } else {
                max
            }
        }),
        AggregateOp::Count => count,
        AggregateOp::Group => 1.0,
        AggregateOp::Stdvar => variance(values),
        AggregateOp::Stddev => variance(values).sqrt(),
        AggregateOp::Quantile => quantile(param.unwrap_or(f64::NAN), values),
        AggregateOp::Topk | AggregateOp::Bottomk => f64::NAN,
    }
}

/// Population variance (Welford)
fn variance(values: &[f64]) -> f64 {
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for (i, &v) in values.iter().enumerate() {
        let n = (i + 1) as f64;
        let delta = v - mean;
        mean += delta / n;
        m2 += delta * (v - mean);
    }
    m2 / values.len() as f64
}

/// φ-quantile with linear interpolation between the closest ranks
pub(crate) fn quantile(phi: f64, values: &[f64]) -> f64 {
    if values.is_empty() || phi.is_nan() {
        return f64::NAN;
    }
    if phi < 0.0 {
        return f64::NEG_INFINITY;
    }
    if phi > 1.0 {
        return f64::INFINITY;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = phi * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let weight = rank - rank.floor();
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Largest (or smallest) `k` members, keeping their own labels; NaN ranks last
fn select_k(mut members: Vec<VectorElement>, k: f64, largest: bool, t: i64) -> Vec<VectorElement> {
    if k.is_nan() || k < 1.0 {
        return Vec::new();
    }
    let k = (k as usize).min(members.len());

    members.sort_by(|a, b| {
        match (a.value.is_nan(), b.value.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if largest => b.value.total_cmp(&a.value),
            (false, false) => a.value.total_cmp(&b.value),
        }
        .then_with(|| a.labels.cmp(&b.labels))
    });
    members.truncate(k);
    for member in &mut members {
        member.timestamp = t;
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(pairs: &[(&str, &str)], value: f64) -> VectorElement {
        VectorElement::new(Labels::from_pairs(pairs.iter().copied()), value, 0)
    }

    fn input() -> Vec<VectorElement> {
        vec![
            element(&[("__name__", "req"), ("job", "api"), ("instance", "a")], 1.0),
            element(&[("__name__", "req"), ("job", "api"), ("instance", "b")], 3.0),
            element(&[("__name__", "req"), ("job", "db"), ("instance", "c")], 10.0),
            element(&[("__name__", "req"), ("instance", "d")], 5.0),
        ]
    }

    #[test]
    fn test_sum_without_grouping_has_empty_labels() {
        let out = aggregate(AggregateOp::Sum, &Grouping::default(), None, input(), 7);
        assert_eq!(out.len(), 1);
        assert!(out[0].labels.is_empty());
        assert_eq!(out[0].value, 19.0);
        assert_eq!(out[0].timestamp, 7);
    }

    #[test]
    fn test_missing_grouping_label_groups_under_empty_value() {
        let by_job = Grouping::By(vec!["job".into()]);
        let out = aggregate(AggregateOp::Count, &by_job, None, input(), 0);
        let got: Vec<(String, f64)> = out
            .iter()
            .map(|e| (e.labels.value_or_empty("job").to_string(), e.value))
            .collect();
        assert_eq!(
            got,
            vec![("".into(), 1.0), ("api".into(), 2.0), ("db".into(), 1.0)]
        );
    }

    #[test]
    fn test_without_drops_metric_name() {
        let without = Grouping::Without(vec!["instance".into()]);
        let out = aggregate(AggregateOp::Max, &without, None, input(), 0);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|e| e.labels.metric_name().is_none()));
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let out = aggregate(AggregateOp::Sum, &Grouping::default(), None, Vec::new(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_avg_min_stddev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(reduce(AggregateOp::Avg, &values, None), 5.0);
        assert_eq!(reduce(AggregateOp::Min, &values, None), 2.0);
        assert!((reduce(AggregateOp::Stdvar, &values, None) - 4.0).abs() < 1e-12);
        assert!((reduce(AggregateOp::Stddev, &values, None) - 2.0).abs() < 1e-12);
        assert_eq!(reduce(AggregateOp::Group, &values, None), 1.0);
    }

    #[test]
    fn test_topk_keeps_series_labels() {
        let out = aggregate(AggregateOp::Topk, &Grouping::default(), Some(2.0), input(), 9);
        let instances: Vec<&str> = out
            .iter()
            .map(|e| e.labels.value_or_empty("instance"))
            .collect();
        assert_eq!(instances, vec!["c", "d"]);
        assert!(out.iter().all(|e| e.labels.metric_name() == Some("req")));
        assert!(out.iter().all(|e| e.timestamp == 9));
    }

    #[test]
    fn test_bottomk_per_group() {
        let by_job = Grouping::By(vec!["job".into()]);
        let out = aggregate(AggregateOp::Bottomk, &by_job, Some(1.0), input(), 0);
        let values: Vec<f64> = out.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![5.0, 1.0, 10.0]);
    }

    #[test]
    fn test_topk_with_zero_k() {
        let out = aggregate(AggregateOp::Topk, &Grouping::default(), Some(0.0), input(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_quantile() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(0.5, &values), 2.5);
        assert_eq!(quantile(0.0, &values), 1.0);
        assert_eq!(quantile(1.0, &values), 4.0);
        assert_eq!(quantile(-0.1, &values), f64::NEG_INFINITY);
        assert_eq!(quantile(1.5, &values), f64::INFINITY);
    }
}
