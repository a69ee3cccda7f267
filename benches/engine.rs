//! Benchmarks for the tsql query pipeline
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tsql::query::executor::CancelToken;
use tsql::query::QueryEngine;
use tsql::storage::catalog::MemoryCatalog;
use tsql::storage::reader::MemoryStorage;
use tsql::storage::series::{Labels, Sample, NANOS_PER_SECOND};

const FIXED_NOW: i64 = 1_700_000_000 * NANOS_PER_SECOND;
const SAMPLES_PER_SERIES: i64 = 240;

fn seeded_engine(series_count: usize) -> QueryEngine {
    let catalog = MemoryCatalog::new().with_now(FIXED_NOW);
    catalog.register_metric("cpu_usage", 15 * NANOS_PER_SECOND);
    catalog.register_metric("requests_total", 60 * NANOS_PER_SECOND);

    let storage = MemoryStorage::new();
    let regions = ["us", "eu", "ap"];

    for series in 0..series_count {
        let labels = Labels::new()
            .with("host", format!("host-{}", series))
            .with("region", regions[series % regions.len()]);
        let id = catalog.register_series("cpu_usage", labels.clone());
        let samples = (0..SAMPLES_PER_SERIES)
            .map(|i| {
                let timestamp = FIXED_NOW - (SAMPLES_PER_SERIES - 1 - i) * 15 * NANOS_PER_SECOND;
                Sample::new(timestamp, (series as f64) + (i % 30) as f64 / 100.0)
            })
            .collect();
        storage.insert_samples(id, samples);

        let id = catalog.register_series("requests_total", labels);
        let samples = (0..60)
            .map(|i| {
                let timestamp = FIXED_NOW - (59 - i) * 60 * NANOS_PER_SECOND;
                Sample::new(timestamp, (series as f64 + 1.0) * i as f64 * 60.0)
            })
            .collect();
        storage.insert_samples(id, samples);
    }

    QueryEngine::new(Arc::new(catalog), Arc::new(storage))
}

fn bench_compile(c: &mut Criterion) {
    let engine = seeded_engine(100);
    let mut group = c.benchmark_group("compile");

    group.bench_function("selector", |b| {
        b.iter(|| engine.compile(black_box("cpu_usage{region=\"us\"}")).unwrap())
    });

    group.bench_function("aggregate_rate", |b| {
        b.iter(|| {
            engine
                .compile(black_box("sum(rate(requests_total)) by (region)"))
                .unwrap()
        })
    });

    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    for series_count in [10, 100] {
        let engine = seeded_engine(series_count);
        group.throughput(Throughput::Elements(
            series_count as u64 * SAMPLES_PER_SERIES as u64,
        ));

        let scan = engine.compile("cpu_usage").unwrap();
        group.bench_function(format!("scan_{}", series_count), |b| {
            b.iter(|| {
                engine
                    .execute(black_box(&scan), CancelToken::new())
                    .collect_frames()
                    .unwrap()
            })
        });

        let aggregate = engine.compile("sum(cpu_usage) by (region)").unwrap();
        group.bench_function(format!("sum_by_region_{}", series_count), |b| {
            b.iter(|| {
                engine
                    .execute(black_box(&aggregate), CancelToken::new())
                    .collect_frames()
                    .unwrap()
            })
        });

        let combine = engine
            .compile("requests_total / cpu_usage{region=\"us\"}")
            .unwrap();
        group.bench_function(format!("combine_{}", series_count), |b| {
            b.iter(|| {
                engine
                    .execute(black_box(&combine), CancelToken::new())
                    .collect_frames()
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);
