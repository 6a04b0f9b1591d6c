//! Query engine
//!
//! Ties parsing, type checking, admission and evaluation together. Every
//! operation that reads the store runs through the scheduler, so metadata
//! lookups count against the same concurrency limit as expression queries.

use crate::query::ast::Expr;
use crate::query::check::check;
use crate::query::context::QueryContext;
use crate::query::error::{QueryError, QueryResult};
use crate::query::evaluator::{evaluate_instant, evaluate_range};
use crate::query::parser::parse_expr;
use crate::query::scheduler::QueryScheduler;
use crate::query::value::QueryValue;
use crate::storage::{BlockStore, LabelMatcher, Labels, TimeRange};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-query limits applied by the engine
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Wall-clock budget of one query, queueing included
    pub timeout: Duration,
    /// Samples one query may pull from storage
    pub max_samples: u64,
    /// Staleness window for instant selectors
    pub lookback_delta: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_samples: 50_000_000,
            lookback_delta: Duration::from_secs(300),
        }
    }
}

pub struct QueryEngine {
    store: Arc<BlockStore>,
    scheduler: Arc<QueryScheduler>,
    options: EngineOptions,
}

impl QueryEngine {
    pub fn new(
        store: Arc<BlockStore>,
        scheduler: Arc<QueryScheduler>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            scheduler,
            options,
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<QueryScheduler> {
        &self.scheduler
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Parse and type-check query text without touching storage
    pub fn prepare(&self, query: &str) -> QueryResult<Expr> {
        if query.trim().is_empty() {
            return Err(QueryError::bad_request("query must not be empty"));
        }
        let expr = parse_expr(query)?;
        check(&expr)?;
        Ok(expr)
    }

    /// Context for one query. A requested timeout can only shorten the
    /// configured one.
    pub fn new_context(&self, timeout: Option<Duration>) -> Arc<QueryContext> {
        let timeout = match timeout {
            Some(requested) => requested.min(self.options.timeout),
            None => self.options.timeout,
        };
        Arc::new(QueryContext::new(timeout, self.options.max_samples))
    }

    /// Evaluate `query` at `time` (milliseconds)
    pub async fn instant_query(
        &self,
        query: &str,
        time: i64,
        timeout: Option<Duration>,
    ) -> QueryResult<QueryValue> {
        let expr = self.prepare(query)?;
        let ctx = self.new_context(timeout);
        let _cancel = ctx.cancel_on_drop();
        let started = Instant::now();

        let store = Arc::clone(&self.store);
        let lookback = self.lookback_millis();
        let result = self
            .scheduler
            .execute(Arc::clone(&ctx), move |ctx| {
                evaluate_instant(&store, ctx, &expr, time, lookback)
            })
            .await;

        log_query(query, "instant", &ctx, started, &result);
        result
    }

    /// Evaluate `query` at every step from `start` to `end` (milliseconds)
    pub async fn range_query(
        &self,
        query: &str,
        start: i64,
        end: i64,
        step: i64,
        timeout: Option<Duration>,
    ) -> QueryResult<QueryValue> {
        if step <= 0 {
            return Err(QueryError::bad_request("step must be greater than zero"));
        }
        if end < start {
            return Err(QueryError::bad_request(
                "end timestamp must not be before start time",
            ));
        }
        let expr = self.prepare(query)?;
        let ctx = self.new_context(timeout);
        let _cancel = ctx.cancel_on_drop();
        let started = Instant::now();

        let store = Arc::clone(&self.store);
        let lookback = self.lookback_millis();
        let result = self
            .scheduler
            .execute(Arc::clone(&ctx), move |ctx| {
                evaluate_range(&store, ctx, &expr, start, end, step, lookback)
            })
            .await;

        log_query(query, "range", &ctx, started, &result);
        result
    }

    /// Label sets of the series matching any of `matcher_sets` in `range`
    pub async fn series(
        &self,
        matcher_sets: Vec<Vec<LabelMatcher>>,
        range: TimeRange,
    ) -> QueryResult<Vec<Labels>> {
        let ctx = self.new_context(None);
        let _cancel = ctx.cancel_on_drop();
        let store = Arc::clone(&self.store);

        self.scheduler
            .execute(Arc::clone(&ctx), move |ctx| {
                let mut found = BTreeSet::new();
                for matchers in &matcher_sets {
                    for series in store.select_series(matchers, range, ctx)? {
                        found.insert(series?.labels().clone());
                    }
                }
                Ok(found.into_iter().collect())
            })
            .await
    }

    pub async fn label_names(
        &self,
        matcher_sets: Vec<Vec<LabelMatcher>>,
        range: TimeRange,
    ) -> QueryResult<Vec<String>> {
        let ctx = self.new_context(None);
        let _cancel = ctx.cancel_on_drop();
        let store = Arc::clone(&self.store);

        self.scheduler
            .execute(Arc::clone(&ctx), move |ctx| {
                Ok(store.label_names(&matcher_sets, range, ctx)?)
            })
            .await
    }

    pub async fn label_values(
        &self,
        name: String,
        matcher_sets: Vec<Vec<LabelMatcher>>,
        range: TimeRange,
    ) -> QueryResult<Vec<String>> {
        let ctx = self.new_context(None);
        let _cancel = ctx.cancel_on_drop();
        let store = Arc::clone(&self.store);

        self.scheduler
            .execute(Arc::clone(&ctx), move |ctx| {
                Ok(store.label_values(&name, &matcher_sets, range, ctx)?)
            })
            .await
    }

    fn lookback_millis(&self) -> i64 {
        i64::try_from(self.options.lookback_delta.as_millis()).unwrap_or(i64::MAX)
    }
}

fn log_query(
    query: &str,
    mode: &'static str,
    ctx: &QueryContext,
    started: Instant,
    result: &QueryResult<QueryValue>,
) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let samples = ctx.samples_scanned();
    match result {
        Ok(value) => debug!(
            query,
            mode,
            elapsed_ms,
            samples,
            series = value.series_count(),
            "query evaluated"
        ),
        Err(e) => debug!(query, mode, elapsed_ms, samples, error = %e, "query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlockWriter, Sample};
    use tempfile::{tempdir, TempDir};

    const SEC: i64 = 1_000;

    fn engine_with(options: EngineOptions, capacity: usize) -> (TempDir, QueryEngine) {
        let dir = tempdir().unwrap();
        let mut writer = BlockWriter::new();
        for (job, step) in [("api", 1.0), ("db", 2.0)] {
            writer.add_series(
                Labels::from_pairs([("__name__", "jobs_total"), ("job", job)]),
                (0..=60).map(|i| Sample::new(i * 10 * SEC, i as f64 * step)),
            );
        }
        writer.write(dir.path().join("a.mvb")).unwrap();

        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let scheduler = Arc::new(QueryScheduler::new(capacity));
        (dir, QueryEngine::new(store, scheduler, options))
    }

    fn engine() -> (TempDir, QueryEngine) {
        engine_with(EngineOptions::default(), 4)
    }

    #[tokio::test]
    async fn test_instant_query() {
        let (_dir, engine) = engine();
        let value = engine
            .instant_query("sum(jobs_total)", 600 * SEC, None)
            .await
            .unwrap();

        match value {
            QueryValue::Vector(points) => {
                assert_eq!(points.len(), 1);
                assert!(points[0].labels.is_empty());
                assert_eq!(points[0].point.v, 180.0);
            }
            other => panic!("expected vector, got {:?}", other),
        }
        assert_eq!(engine.scheduler().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_range_query_points() {
        let (_dir, engine) = engine();
        let value = engine
            .range_query("jobs_total{job=\"api\"}", 0, 600 * SEC, 60 * SEC, None)
            .await
            .unwrap();

        match value {
            QueryValue::Matrix(series) => {
                assert_eq!(series.len(), 1);
                assert_eq!(series[0].points.len(), 11);
            }
            other => panic!("expected matrix, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_queries_fail_before_admission() {
        let (_dir, engine) = engine();

        assert!(matches!(
            engine.instant_query("   ", 0, None).await,
            Err(QueryError::BadRequest(_))
        ));
        assert!(matches!(
            engine.instant_query("sum(", 0, None).await,
            Err(QueryError::Parse(_))
        ));
        assert!(matches!(
            engine.instant_query("nope(jobs_total)", 0, None).await,
            Err(QueryError::UnknownFunction(_))
        ));
        assert!(matches!(
            engine.range_query("jobs_total", 10, 0, 1, None).await,
            Err(QueryError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_sample_budget() {
        let options = EngineOptions {
            max_samples: 10,
            ..EngineOptions::default()
        };
        let (_dir, engine) = engine_with(options, 1);

        let result = engine
            .instant_query("sum_over_time(jobs_total[10m])", 600 * SEC, None)
            .await;
        assert!(matches!(result, Err(QueryError::TooManySamples { limit: 10 })));
        assert_eq!(engine.scheduler().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_requested_timeout_never_raises_limit() {
        let options = EngineOptions {
            timeout: Duration::from_secs(1),
            ..EngineOptions::default()
        };
        let (_dir, engine) = engine_with(options, 1);

        let ctx = engine.new_context(Some(Duration::from_secs(60)));
        assert!(ctx.remaining() <= Duration::from_secs(1));
        let ctx = engine.new_context(Some(Duration::from_millis(10)));
        assert!(ctx.remaining() <= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_metadata() {
        let (_dir, engine) = engine();
        let all = TimeRange::ALL;

        let names = engine.label_names(Vec::new(), all).await.unwrap();
        assert_eq!(names, vec!["__name__".to_string(), "job".to_string()]);

        let values = engine
            .label_values("job".into(), Vec::new(), all)
            .await
            .unwrap();
        assert_eq!(values, vec!["api".to_string(), "db".to_string()]);

        let matchers = vec![vec![LabelMatcher::equal("job", "db")]];
        let series = engine.series(matchers, all).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].get("job"), Some("db"));
    }

    #[tokio::test]
    async fn test_deadline_during_storage_iteration() {
        let dir = tempdir().unwrap();
        let mut writer = BlockWriter::new();
        for instance in 0..50 {
            writer.add_series(
                Labels::from_pairs([("__name__", "m".to_string()), ("instance", instance.to_string())]),
                (0..10_000).map(|i| Sample::new(i * 10 * SEC, i as f64)),
            );
        }
        writer.write(dir.path().join("big.mvb")).unwrap();

        let options = EngineOptions {
            timeout: Duration::from_millis(30),
            max_samples: u64::MAX,
            ..EngineOptions::default()
        };
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let engine = QueryEngine::new(store, Arc::new(QueryScheduler::new(1)), options);

        let started = Instant::now();
        let result = engine
            .range_query("sum(rate(m[30m]))", 0, 100_000 * SEC, 10 * SEC, None)
            .await;

        assert!(matches!(result, Err(QueryError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.scheduler().in_flight(), 0);

        // The slot is free again for the next query
        let options = EngineOptions {
            timeout: Duration::from_secs(10),
            ..options
        };
        let engine = QueryEngine::new(
            Arc::clone(engine.store()),
            Arc::clone(engine.scheduler()),
            options,
        );
        let value = engine
            .instant_query("count(m)", 100 * SEC, None)
            .await
            .unwrap();
        assert_eq!(value.series_count(), 1);
    }
}
