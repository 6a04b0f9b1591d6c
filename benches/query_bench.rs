//! Benchmarks for the block reader and the evaluator
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use metrics_viewer::query::{evaluate_instant, evaluate_range, parse_expr, QueryContext};
use metrics_viewer::storage::{
    decode_chunk, encode_chunk, BlockStore, BlockWriter, LabelMatcher, Labels, Sample, TimeRange,
    BLOCK_EXTENSION,
};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const SCRAPE_MS: i64 = 15_000;
const HOUR_MS: i64 = 3_600_000;

fn counter_samples(count: usize, rate: f64) -> Vec<Sample> {
    (0..count)
        .map(|i| Sample::new(i as i64 * SCRAPE_MS, i as f64 * rate))
        .collect()
}

/// 100 series over two blocks of one hour each
fn build_dataset() -> (TempDir, BlockStore) {
    let dir = tempdir().unwrap();
    let per_block = (HOUR_MS / SCRAPE_MS) as usize;

    for block in 0..2i64 {
        let mut writer = BlockWriter::new();
        for s in 0..100 {
            let labels = Labels::from_pairs([
                ("__name__", "http_requests_total".to_string()),
                ("job", format!("job-{}", s % 5)),
                ("instance", format!("host-{}", s)),
            ]);
            let offset = block * HOUR_MS;
            let samples = counter_samples(per_block, (s + 1) as f64)
                .into_iter()
                .map(|p| Sample::new(p.t + offset, p.v + offset as f64));
            writer.add_series(labels, samples);
        }
        let path = dir
            .path()
            .join(format!("block-{}.{}", block, BLOCK_EXTENSION));
        writer.write(path).unwrap();
    }

    let store = BlockStore::open(dir.path()).unwrap();
    (dir, store)
}

fn ctx() -> QueryContext {
    QueryContext::new(Duration::from_secs(60), u64::MAX)
}

fn bench_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk");

    for size in [120, 1000] {
        let samples = counter_samples(size, 1.5);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("encode_{}", size), |b| {
            b.iter(|| encode_chunk(black_box(&samples)).unwrap())
        });

        let encoded = encode_chunk(&samples).unwrap();
        group.bench_function(format!("decode_{}", size), |b| {
            b.iter(|| decode_chunk(black_box(&encoded)).unwrap())
        });
    }

    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let (_dir, store) = build_dataset();
    let mut group = c.benchmark_group("select");

    group.bench_function("select_one_job", |b| {
        let matchers = [
            LabelMatcher::equal("__name__", "http_requests_total"),
            LabelMatcher::equal("job", "job-3"),
        ];
        b.iter(|| {
            let ctx = ctx();
            store
                .select_series(black_box(&matchers), TimeRange::ALL, &ctx)
                .unwrap()
                .count()
        })
    });

    group.bench_function("read_all_samples", |b| {
        let matchers = [LabelMatcher::equal("__name__", "http_requests_total")];
        b.iter(|| {
            let ctx = ctx();
            let mut total = 0;
            for series in store.select_series(&matchers, TimeRange::ALL, &ctx).unwrap() {
                let series = series.unwrap();
                total += series.iter(TimeRange::ALL, &ctx).count();
            }
            total
        })
    });

    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let (_dir, store) = build_dataset();
    let mut group = c.benchmark_group("evaluate");
    let lookback = 300_000;

    let instant = parse_expr("sum by (job) (rate(http_requests_total[5m]))").unwrap();
    group.bench_function("instant_sum_rate", |b| {
        b.iter(|| {
            evaluate_instant(&store, &ctx(), black_box(&instant), HOUR_MS, lookback).unwrap()
        })
    });

    let range = parse_expr("sum by (job) (rate(http_requests_total[5m]))").unwrap();
    group.bench_function("range_sum_rate_2h", |b| {
        b.iter(|| {
            evaluate_range(
                &store,
                &ctx(),
                black_box(&range),
                0,
                2 * HOUR_MS,
                60_000,
                lookback,
            )
            .unwrap()
        })
    });

    let binary = parse_expr("http_requests_total / on (instance) http_requests_total").unwrap();
    group.bench_function("instant_vector_match", |b| {
        b.iter(|| evaluate_instant(&store, &ctx(), black_box(&binary), HOUR_MS, lookback).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_chunk, bench_select, bench_evaluate);
criterion_main!(benches);
