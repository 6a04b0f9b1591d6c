//! Expression evaluation
//!
//! Evaluation is depth-first and pull based. Each selector resolves its
//! series once per query, then every evaluation step opens fresh iterators
//! over the step's window. All storage reads go through the query's
//! `QueryContext`, so the sample budget, the deadline and cancellation are
//! observed at every pull.

use crate::query::aggregate::aggregate;
use crate::query::ast::{BinaryExpr, BinaryOp, Call, Expr, MatrixSelector, VectorMatching, VectorSelector};
use crate::query::context::QueryContext;
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions::Function;
use crate::query::value::{InstantPoint, QueryValue, RangeSeries, SeriesPoints, Value, VectorElement};
use crate::storage::{BlockStore, Labels, Sample, Series, StorageResult, TimeRange};
use std::collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap};

/// Evaluate `expr` at a single instant `t` (milliseconds)
pub fn evaluate_instant(
    store: &BlockStore,
    ctx: &QueryContext,
    expr: &Expr,
    t: i64,
    lookback_ms: i64,
) -> QueryResult<QueryValue> {
    Evaluator::new(store, ctx, lookback_ms, t, t).instant(expr)
}

/// Evaluate `expr` at `start, start + step, ...` up to and including `end`
pub fn evaluate_range(
    store: &BlockStore,
    ctx: &QueryContext,
    expr: &Expr,
    start: i64,
    end: i64,
    step: i64,
    lookback_ms: i64,
) -> QueryResult<QueryValue> {
    if step <= 0 {
        return Err(QueryError::bad_request("step must be greater than zero"));
    }
    if end < start {
        return Err(QueryError::bad_request("end timestamp must not be before start time"));
    }
    Evaluator::new(store, ctx, lookback_ms, start, end).range(expr, step)
}

/// Number of evaluation steps of a range query
pub fn step_count(start: i64, end: i64, step: i64) -> i64 {
    if step <= 0 || end < start {
        return 0;
    }
    (end - start) / step + 1
}

struct Evaluator<'a> {
    store: &'a BlockStore,
    ctx: &'a QueryContext,
    lookback: i64,
    start: i64,
    end: i64,
    /// Series per selector node, keyed by node address
    selected: HashMap<usize, Vec<Series>>,
}

impl<'a> Evaluator<'a> {
    fn new(store: &'a BlockStore, ctx: &'a QueryContext, lookback: i64, start: i64, end: i64) -> Self {
        Self {
            store,
            ctx,
            lookback,
            start,
            end,
            selected: HashMap::new(),
        }
    }

    fn instant(mut self, expr: &Expr) -> QueryResult<QueryValue> {
        let t = self.start;
        let value = match self.eval(expr, t)? {
            Value::Scalar(v) => QueryValue::Scalar(Sample::new(t, v)),
            Value::String(value) => QueryValue::String { t, value },
            Value::Vector(elements) => {
                ensure_unique_labels(&elements)?;
                QueryValue::Vector(
                    elements
                        .into_iter()
                        .map(|e| InstantPoint {
                            labels: e.labels,
                            point: Sample::new(t, e.value),
                        })
                        .collect(),
                )
            }
            Value::Matrix(series) => QueryValue::Matrix(
                series
                    .into_iter()
                    .map(|s| SeriesPoints {
                        labels: s.labels,
                        points: s.samples,
                    })
                    .collect(),
            ),
        };
        Ok(value)
    }

    fn range(mut self, expr: &Expr, step: i64) -> QueryResult<QueryValue> {
        let mut series: BTreeMap<Labels, Vec<Sample>> = BTreeMap::new();

        let mut t = self.start;
        while t <= self.end {
            self.ctx.check()?;
            match self.eval(expr, t)? {
                Value::Scalar(v) => series.entry(Labels::new()).or_default().push(Sample::new(t, v)),
                Value::Vector(elements) => {
                    for element in elements {
                        let points = series.entry(element.labels).or_default();
                        if points.last().is_some_and(|p| p.t == t) {
                            return Err(duplicate_labelset());
                        }
                        points.push(Sample::new(t, element.value));
                    }
                }
                other => {
                    return Err(QueryError::bad_request(format!(
                        "invalid expression type {} for range query, must be scalar or vector",
                        other.value_type()
                    )))
                }
            }
            t = match t.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(QueryValue::Matrix(
            series
                .into_iter()
                .map(|(labels, points)| SeriesPoints { labels, points })
                .collect(),
        ))
    }

    fn eval(&mut self, expr: &Expr, t: i64) -> QueryResult<Value> {
        self.ctx.check()?;
        match expr {
            Expr::NumberLiteral(n) => Ok(Value::Scalar(*n)),
            Expr::StringLiteral(s) => Ok(Value::String(s.clone())),
            Expr::Paren(inner) => self.eval(inner, t),
            Expr::Negate(inner) => match self.eval(inner, t)? {
                Value::Scalar(v) => Ok(Value::Scalar(-v)),
                Value::Vector(elements) => Ok(Value::Vector(
                    elements
                        .into_iter()
                        .map(|e| VectorElement::new(e.labels.without_metric_name(), -e.value, t))
                        .collect(),
                )),
                other => Err(QueryError::type_mismatch(format!(
                    "cannot negate a {}",
                    other.value_type()
                ))),
            },
            Expr::VectorSelector(vs) => self.eval_vector_selector(vs, t).map(Value::Vector),
            Expr::MatrixSelector(ms) => self.eval_matrix_selector(ms, t).map(Value::Matrix),
            Expr::Call(call) => self.eval_call(call, t),
            Expr::Aggregate(agg) => {
                let param = match &agg.param {
                    Some(param) => Some(self.eval_scalar(param, t)?),
                    None => None,
                };
                let input = self.eval_vector(&agg.expr, t)?;
                Ok(Value::Vector(aggregate(agg.op, &agg.grouping, param, input, t)))
            }
            Expr::Binary(bin) => self.eval_binary(bin, t),
        }
    }

    fn eval_vector(&mut self, expr: &Expr, t: i64) -> QueryResult<Vec<VectorElement>> {
        match self.eval(expr, t)? {
            Value::Vector(elements) => Ok(elements),
            other => Err(QueryError::type_mismatch(format!(
                "expected instant vector, got {}",
                other.value_type()
            ))),
        }
    }

    fn eval_scalar(&mut self, expr: &Expr, t: i64) -> QueryResult<f64> {
        match self.eval(expr, t)? {
            Value::Scalar(v) => Ok(v),
            other => Err(QueryError::type_mismatch(format!(
                "expected scalar, got {}",
                other.value_type()
            ))),
        }
    }

    /// Series of a selector over the whole query span, resolved on first use
    fn series_for(&mut self, vs: &VectorSelector, width: i64) -> QueryResult<&[Series]> {
        let key = vs as *const VectorSelector as usize;
        match self.selected.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut().as_slice()),
            Entry::Vacant(entry) => {
                let span = TimeRange::try_new(
                    self.start
                        .saturating_sub(vs.offset)
                        .saturating_sub(width)
                        .saturating_add(1),
                    self.end.saturating_sub(vs.offset).saturating_add(1),
                );
                let series = match span {
                    Some(span) => self
                        .store
                        .select_series(&vs.matchers, span, self.ctx)?
                        .collect::<StorageResult<Vec<_>>>()?,
                    None => Vec::new(),
                };
                Ok(entry.insert(series).as_slice())
            }
        }
    }

    /// Newest sample per series in `(t - offset - lookback, t - offset]`
    fn eval_vector_selector(&mut self, vs: &VectorSelector, t: i64) -> QueryResult<Vec<VectorElement>> {
        let ctx = self.ctx;
        let lookback = self.lookback;
        let Some(window) = TimeRange::ending_at(t.saturating_sub(vs.offset), lookback) else {
            return Ok(Vec::new());
        };

        let mut elements = Vec::new();
        for series in self.series_for(vs, lookback)? {
            let mut newest = None;
            for sample in series.iter(window, ctx) {
                newest = Some(sample?);
            }
            if let Some(sample) = newest {
                elements.push(VectorElement::new(series.labels().clone(), sample.v, sample.t));
            }
        }
        Ok(elements)
    }

    /// All samples per series in `(t - offset - range, t - offset]`
    fn eval_matrix_selector(&mut self, ms: &MatrixSelector, t: i64) -> QueryResult<Vec<RangeSeries>> {
        let ctx = self.ctx;
        let Some(window) = TimeRange::ending_at(t.saturating_sub(ms.selector.offset), ms.range) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for series in self.series_for(&ms.selector, ms.range)? {
            let samples = series.iter(window, ctx).collect::<StorageResult<Vec<_>>>()?;
            if !samples.is_empty() {
                out.push(RangeSeries {
                    labels: series.labels().clone(),
                    samples,
                });
            }
        }
        Ok(out)
    }

    fn eval_call(&mut self, call: &Call, t: i64) -> QueryResult<Value> {
        let func = Function::from_name(&call.func)
            .ok_or_else(|| QueryError::UnknownFunction(call.func.clone()))?;
        let arg = |i: usize| {
            call.args
                .get(i)
                .ok_or_else(|| QueryError::type_mismatch(format!("missing argument to {}", call.func)))
        };

        match func {
            Function::Time => Ok(Value::Scalar(t as f64 / 1000.0)),
            Function::Vector => {
                let v = self.eval_scalar(arg(0)?, t)?;
                Ok(Value::Vector(vec![VectorElement::new(Labels::new(), v, t)]))
            }
            Function::Scalar => {
                let elements = self.eval_vector(arg(0)?, t)?;
                match elements.as_slice() {
                    [only] => Ok(Value::Scalar(only.value)),
                    _ => Ok(Value::Scalar(f64::NAN)),
                }
            }
            Function::Timestamp => {
                let elements = self.eval_vector(arg(0)?, t)?;
                Ok(Value::Vector(
                    elements
                        .into_iter()
                        .map(|e| {
                            VectorElement::new(e.labels.without_metric_name(), e.timestamp as f64 / 1000.0, t)
                        })
                        .collect(),
                ))
            }
            f if f.is_range() => {
                let Expr::MatrixSelector(ms) = arg(0)?.unwrap_parens() else {
                    return Err(QueryError::type_mismatch(format!(
                        "expected range vector selector in call to {}",
                        call.func
                    )));
                };
                let window_end = t.saturating_sub(ms.selector.offset);
                let window = (window_end.saturating_sub(ms.range), window_end);

                let mut out = Vec::new();
                for series in self.eval_matrix_selector(ms, t)? {
                    if let Some(value) = f.eval_range(&series.samples, window) {
                        out.push(VectorElement::new(output_labels(f, series.labels), value, t));
                    }
                }
                Ok(Value::Vector(out))
            }
            f => {
                let elements = self.eval_vector(arg(0)?, t)?;
                let param = match call.args.get(1) {
                    Some(expr) => Some(self.eval_scalar(expr, t)?),
                    None => None,
                };
                Ok(Value::Vector(
                    elements
                        .into_iter()
                        .map(|e| VectorElement::new(output_labels(f, e.labels), f.eval_math(e.value, param), t))
                        .collect(),
                ))
            }
        }
    }

    fn eval_binary(&mut self, bin: &BinaryExpr, t: i64) -> QueryResult<Value> {
        let lhs = self.eval(&bin.lhs, t)?;
        let rhs = self.eval(&bin.rhs, t)?;

        match (lhs, rhs) {
            (Value::Scalar(l), Value::Scalar(r)) => bin
                .op
                .apply(l, r)
                .map(Value::Scalar)
                .ok_or_else(|| QueryError::type_mismatch(format!("{} between scalars", bin.op))),
            (Value::Vector(elements), Value::Scalar(r)) => {
                Ok(Value::Vector(vector_scalar(bin, elements, r, false, t)))
            }
            (Value::Scalar(l), Value::Vector(elements)) => {
                Ok(Value::Vector(vector_scalar(bin, elements, l, true, t)))
            }
            (Value::Vector(l), Value::Vector(r)) => Ok(Value::Vector(vector_vector(bin, l, r, t))),
            (l, r) => Err(QueryError::type_mismatch(format!(
                "binary expression must contain only scalar and instant vector types, got {} {} {}",
                l.value_type(),
                bin.op,
                r.value_type()
            ))),
        }
    }
}

fn output_labels(func: Function, labels: Labels) -> Labels {
    if func.keeps_metric_name() {
        labels
    } else {
        labels.without_metric_name()
    }
}

fn duplicate_labelset() -> QueryError {
    QueryError::Execution("vector cannot contain metrics with the same labelset".to_string())
}

fn ensure_unique_labels(elements: &[VectorElement]) -> QueryResult<()> {
    let mut seen = BTreeSet::new();
    for element in elements {
        if !seen.insert(&element.labels) {
            return Err(duplicate_labelset());
        }
    }
    Ok(())
}

/// Whether the result of `op` loses the metric name
fn drops_metric_name(bin: &BinaryExpr) -> bool {
    !bin.op.is_comparison() || bin.return_bool
}

/// Apply an operator between each vector element and a scalar.
///
/// `scalar_on_left` preserves operand order for non-commutative operators.
/// Filtering comparisons keep the element's own value.
fn vector_scalar(
    bin: &BinaryExpr,
    elements: Vec<VectorElement>,
    scalar: f64,
    scalar_on_left: bool,
    t: i64,
) -> Vec<VectorElement> {
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        let (l, r) = if scalar_on_left {
            (scalar, element.value)
        } else {
            (element.value, scalar)
        };
        let Some(result) = bin.op.apply(l, r) else {
            continue;
        };

        if bin.op.is_comparison() && !bin.return_bool {
            if result == 1.0 {
                out.push(VectorElement::new(element.labels, element.value, t));
            }
            continue;
        }

        let labels = if drops_metric_name(bin) {
            element.labels.without_metric_name()
        } else {
            element.labels
        };
        out.push(VectorElement::new(labels, result, t));
    }
    out
}

fn matching_key(labels: &Labels, matching: &VectorMatching) -> Labels {
    match matching {
        VectorMatching::On(names) => labels.keep(names),
        VectorMatching::Ignoring(names) => labels.drop_with_name(names),
    }
}

/// Labels of a one-to-one match, taken from the left-hand side
fn result_labels(bin: &BinaryExpr, labels: &Labels, matching: &VectorMatching) -> Labels {
    let mut result = match matching {
        VectorMatching::On(names) => labels.keep(names),
        VectorMatching::Ignoring(names) => {
            let mut kept = labels.clone();
            for name in names {
                kept.remove(name);
            }
            kept
        }
    };
    if drops_metric_name(bin) {
        result.remove(crate::storage::METRIC_NAME);
    }
    result
}

/// One-to-one and set operations between two instant vectors.
///
/// When several elements of one side share a matching key, the one
/// enumerated last wins.
fn vector_vector(
    bin: &BinaryExpr,
    lhs: Vec<VectorElement>,
    rhs: Vec<VectorElement>,
    t: i64,
) -> Vec<VectorElement> {
    let matching = bin.matching.clone().unwrap_or_default();

    match bin.op {
        BinaryOp::And => {
            let keys: BTreeSet<Labels> = rhs.iter().map(|e| matching_key(&e.labels, &matching)).collect();
            lhs.into_iter()
                .filter(|e| keys.contains(&matching_key(&e.labels, &matching)))
                .collect()
        }
        BinaryOp::Unless => {
            let keys: BTreeSet<Labels> = rhs.iter().map(|e| matching_key(&e.labels, &matching)).collect();
            lhs.into_iter()
                .filter(|e| !keys.contains(&matching_key(&e.labels, &matching)))
                .collect()
        }
        BinaryOp::Or => {
            let keys: BTreeSet<Labels> = lhs.iter().map(|e| matching_key(&e.labels, &matching)).collect();
            let extra: Vec<VectorElement> = rhs
                .into_iter()
                .filter(|e| !keys.contains(&matching_key(&e.labels, &matching)))
                .collect();
            lhs.into_iter().chain(extra).collect()
        }
        op => {
            let mut right: BTreeMap<Labels, VectorElement> = BTreeMap::new();
            for element in rhs {
                right.insert(matching_key(&element.labels, &matching), element);
            }
            let mut left: BTreeMap<Labels, VectorElement> = BTreeMap::new();
            for element in lhs {
                left.insert(matching_key(&element.labels, &matching), element);
            }

            let mut out = Vec::new();
            for (key, l) in left {
                let Some(r) = right.get(&key) else {
                    continue;
                };
                let Some(result) = op.apply(l.value, r.value) else {
                    continue;
                };
                if op.is_comparison() && !bin.return_bool {
                    if result == 1.0 {
                        out.push(VectorElement::new(result_labels(bin, &l.labels, &matching), l.value, t));
                    }
                    continue;
                }
                out.push(VectorElement::new(result_labels(bin, &l.labels, &matching), result, t));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_expr;
    use crate::storage::BlockWriter;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const SEC: i64 = 1_000;
    const LOOKBACK: i64 = 300 * SEC;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs.iter().copied())
    }

    /// Fixture dataset:
    /// - `up{job="api"}` last sample at 50s, `up{job="db"}` last sample at -250s
    /// - `http_requests{instance="a"|"b"}` counters scraped every 15s over [0, 3600]
    /// - `errors{instance="a"|"b"}` and `capacity{instance="a"}` for matching tests
    fn fixture() -> (TempDir, BlockStore) {
        let dir = tempdir().unwrap();
        let mut writer = BlockWriter::new().chunk_size(16);

        writer.add_series(
            labels(&[("__name__", "up"), ("job", "api")]),
            [Sample::new(-400 * SEC, 1.0), Sample::new(50 * SEC, 1.0)],
        );
        writer.add_series(
            labels(&[("__name__", "up"), ("job", "db")]),
            [Sample::new(-250 * SEC, 0.0)],
        );

        for (instance, per_scrape) in [("a", 1.0), ("b", 3.0)] {
            let series = labels(&[("__name__", "http_requests"), ("instance", instance)]);
            writer.add_series(
                series,
                (0..=240).map(|i| Sample::new(i * 15 * SEC, i as f64 * per_scrape)),
            );
        }

        writer.add_series(
            labels(&[("__name__", "errors"), ("instance", "a")]),
            [Sample::new(100 * SEC, 6.0)],
        );
        writer.add_series(
            labels(&[("__name__", "errors"), ("instance", "b")]),
            [Sample::new(100 * SEC, 4.0)],
        );
        writer.add_series(
            labels(&[("__name__", "capacity"), ("instance", "a")]),
            [Sample::new(100 * SEC, 0.0)],
        );

        writer.write(dir.path().join("01.mvb")).unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn ctx() -> QueryContext {
        QueryContext::new(Duration::from_secs(30), 1_000_000)
    }

    fn instant(store: &BlockStore, query: &str, t: i64) -> QueryResult<QueryValue> {
        let expr = parse_expr(query).unwrap();
        evaluate_instant(store, &ctx(), &expr, t, LOOKBACK)
    }

    fn vector(value: QueryValue) -> Vec<InstantPoint> {
        match value {
            QueryValue::Vector(points) => points,
            other => panic!("expected vector, got {:?}", other),
        }
    }

    #[test]
    fn test_instant_selector_uses_lookback() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "up", 100 * SEC).unwrap());

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].labels.get("job"), Some("api"));
        assert_eq!(points[0].point, Sample::new(100 * SEC, 1.0));
    }

    #[test]
    fn test_offset_shifts_window() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "up offset 200s", 100 * SEC).unwrap());
        // Window becomes (-400s, -100s]
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].labels.get("job"), Some("db"));
    }

    #[test]
    fn test_range_query_point_count() {
        let (_dir, store) = fixture();
        let expr = parse_expr("http_requests").unwrap();
        let result = evaluate_range(&store, &ctx(), &expr, 0, 3600 * SEC, 15 * SEC, LOOKBACK).unwrap();

        let QueryValue::Matrix(series) = result else {
            panic!("expected matrix");
        };
        assert_eq!(series.len(), 2);
        for s in &series {
            assert_eq!(s.points.len(), 241);
            let expected: Vec<i64> = (0..=240).map(|i| i * 15 * SEC).collect();
            let got: Vec<i64> = s.points.iter().map(|p| p.t).collect();
            assert_eq!(got, expected);
        }
        assert_eq!(step_count(0, 3600 * SEC, 15 * SEC), 241);
    }

    #[test]
    fn test_sum_of_rate_has_empty_labels() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "sum(rate(http_requests[5m]))", 1800 * SEC).unwrap());

        assert_eq!(points.len(), 1);
        assert!(points[0].labels.is_empty());
        // 1/15 + 3/15 per second
        assert!((points[0].point.v - 4.0 / 15.0).abs() < 1e-9, "got {}", points[0].point.v);
    }

    #[test]
    fn test_rate_drops_metric_name() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "rate(http_requests[1m])", 1800 * SEC).unwrap());
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.labels.metric_name().is_none()));
    }

    #[test]
    fn test_rounding_functions_drop_metric_name() {
        let (_dir, store) = fixture();
        for query in ["ceil(up)", "floor(up)", "round(up)", "round(up, 0.5)"] {
            let points = vector(instant(&store, query, 100 * SEC).unwrap());
            assert_eq!(points.len(), 1, "{}", query);
            assert_eq!(points[0].labels, labels(&[("job", "api")]), "{}", query);
        }

        let points = vector(instant(&store, "last_over_time(up[10m])", 100 * SEC).unwrap());
        assert!(!points.is_empty());
        assert!(points.iter().all(|p| p.labels.metric_name() == Some("up")));
    }

    #[test]
    fn test_aggregation_over_nothing_is_empty() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "sum(does_not_exist)", 100 * SEC).unwrap());
        assert!(points.is_empty());
    }

    #[test]
    fn test_vector_matching_and_division_by_zero() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "errors / capacity", 100 * SEC).unwrap());
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].labels, labels(&[("instance", "a")]));
        assert_eq!(points[0].point.v, f64::INFINITY);
    }

    #[test]
    fn test_on_matching_and_last_wins() {
        let (_dir, store) = fixture();
        // Both errors series reduce to the empty key; instance="b" is enumerated last
        let points = vector(instant(&store, "errors + on() vector(1)", 100 * SEC).unwrap());
        assert_eq!(points.len(), 1);
        assert!(points[0].labels.is_empty());
        assert_eq!(points[0].point.v, 5.0);
    }

    #[test]
    fn test_comparison_filters_and_bool() {
        let (_dir, store) = fixture();
        let filtered = vector(instant(&store, "errors > 5", 100 * SEC).unwrap());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].labels.metric_name(), Some("errors"));
        assert_eq!(filtered[0].point.v, 6.0);

        let flags = vector(instant(&store, "errors > bool 5", 100 * SEC).unwrap());
        let values: Vec<f64> = flags.iter().map(|p| p.point.v).collect();
        assert_eq!(values, vec![1.0, 0.0]);
        assert!(flags.iter().all(|p| p.labels.metric_name().is_none()));
    }

    #[test]
    fn test_set_operators() {
        let (_dir, store) = fixture();
        let and = vector(instant(&store, "errors and capacity", 100 * SEC).unwrap());
        assert_eq!(and.len(), 1);
        assert_eq!(and[0].labels.get("instance"), Some("a"));

        let unless = vector(instant(&store, "errors unless capacity", 100 * SEC).unwrap());
        assert_eq!(unless.len(), 1);
        assert_eq!(unless[0].labels.get("instance"), Some("b"));

        let or = vector(instant(&store, "capacity or errors", 100 * SEC).unwrap());
        assert_eq!(or.len(), 2);
        assert_eq!(or[0].labels.metric_name(), Some("capacity"));
        assert_eq!(or[1].labels.get("instance"), Some("b"));
    }

    #[test]
    fn test_scalar_results() {
        let (_dir, store) = fixture();
        assert_eq!(
            instant(&store, "1 / 0", 0).unwrap(),
            QueryValue::Scalar(Sample::new(0, f64::INFINITY))
        );
        assert_eq!(
            instant(&store, "time()", 90 * SEC).unwrap(),
            QueryValue::Scalar(Sample::new(90 * SEC, 90.0))
        );
        assert_eq!(
            instant(&store, "scalar(capacity)", 100 * SEC).unwrap(),
            QueryValue::Scalar(Sample::new(100 * SEC, 0.0))
        );
        let QueryValue::Scalar(nan) = instant(&store, "scalar(errors)", 100 * SEC).unwrap() else {
            panic!("expected scalar");
        };
        assert!(nan.v.is_nan());
    }

    #[test]
    fn test_timestamp_reports_sample_time() {
        let (_dir, store) = fixture();
        let points = vector(instant(&store, "timestamp(up)", 100 * SEC).unwrap());
        assert_eq!(points[0].point.v, 50.0);
    }

    #[test]
    fn test_duplicate_labelset_is_rejected() {
        let (_dir, store) = fixture();
        let unique = instant(&store, "errors * 1 or capacity * 1", 100 * SEC);
        assert!(unique.is_ok());
        let err = instant(&store, r#"timestamp({__name__=~"errors|capacity", instance="a"})"#, 100 * SEC)
            .unwrap_err();
        assert!(matches!(err, QueryError::Execution(_)));
    }

    #[test]
    fn test_sample_budget_aborts_query() {
        let (_dir, store) = fixture();
        let expr = parse_expr("sum(rate(http_requests[1h]))").unwrap();
        let ctx = QueryContext::new(Duration::from_secs(30), 100);

        let err = evaluate_instant(&store, &ctx, &expr, 3600 * SEC, LOOKBACK).unwrap_err();
        assert!(matches!(err, QueryError::TooManySamples { limit: 100 }));
        // The pull that crossed the limit is counted but never returned
        assert_eq!(ctx.samples_scanned(), 101);
    }

    #[test]
    fn test_cancelled_context_stops_evaluation() {
        let (_dir, store) = fixture();
        let expr = parse_expr("http_requests").unwrap();
        let ctx = ctx();
        ctx.cancel();

        let err = evaluate_range(&store, &ctx, &expr, 0, 3600 * SEC, 15 * SEC, LOOKBACK).unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
    }

    #[test]
    fn test_instant_evaluation_is_repeatable() {
        let (_dir, store) = fixture();
        let first = instant(&store, "topk(1, rate(http_requests[5m]))", 900 * SEC).unwrap();
        let second = instant(&store, "topk(1, rate(http_requests[5m]))", 900 * SEC).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_range_query_rejects_matrix_result() {
        let (_dir, store) = fixture();
        let expr = parse_expr("up[5m]").unwrap();
        let err = evaluate_range(&store, &ctx(), &expr, 0, 60 * SEC, 15 * SEC, LOOKBACK).unwrap_err();
        assert!(matches!(err, QueryError::BadRequest(_)));
    }
}
