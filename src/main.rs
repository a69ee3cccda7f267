use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tsql::metrics;
use tsql::query::QueryEngine;
use tsql::storage::catalog::{Catalog, MemoryCatalog};
use tsql::storage::reader::MemoryStorage;
use tsql::storage::series::{Labels, Sample, NANOS_PER_SECOND};

#[tokio::main]
async fn main() {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .pretty()
        .init();

    // Initialize metrics
    let metrics_addr = SocketAddr::from(([127, 0, 0, 1], 9090));
    if let Err(e) = metrics::init_metrics(metrics_addr) {
        eprintln!("Failed to initialize metrics: {}", e);
    } else {
        info!("Metrics server listening on {}", metrics_addr);
    }

    info!("Starting tsql shell...");
    let (catalog, storage) = seed_demo_data();
    info!(
        "Demo metrics loaded: cpu_usage (15s), requests_total (60s), {} series",
        catalog.series_count()
    );
    let engine = QueryEngine::new(catalog, storage);
    info!("Type a query, or 'explain <query>' to inspect its plan");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            handle_line(&engine, line).await;
                        }
                    }
                    _ => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
}

async fn handle_line(engine: &QueryEngine, line: &str) {
    if let Some(query) = line.strip_prefix("explain ") {
        match engine.explain(query) {
            Ok(report) => print_json(&report),
            Err(err) => eprintln!("{}", err),
        }
        return;
    }

    match engine.run_collect(line).await {
        Ok(frames) => {
            for frame in &frames {
                print_json(frame);
            }
        }
        Err(err) => eprintln!("{}", err),
    }
}

fn prompt() {
    print!("tsql> ");
    let _ = std::io::stdout().flush();
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("Failed to render output: {}", err),
    }
}

/// Seeds an hour of synthetic samples per series, anchored at the wall
/// clock so the default query window covers them.
fn seed_demo_data() -> (Arc<MemoryCatalog>, Arc<MemoryStorage>) {
    let catalog = MemoryCatalog::new();
    catalog.register_metric("cpu_usage", 15 * NANOS_PER_SECOND);
    catalog.register_metric("requests_total", 60 * NANOS_PER_SECOND);

    let storage = MemoryStorage::new();
    let now = catalog.now();

    for (host, region, base) in [("a", "us", 0.30), ("b", "us", 0.55), ("c", "eu", 0.20)] {
        let id = catalog.register_series(
            "cpu_usage",
            Labels::new().with("host", host).with("region", region),
        );
        let samples = (0..240)
            .map(|i| {
                let timestamp = now - (239 - i) * 15 * NANOS_PER_SECOND;
                let value = base + (i % 20) as f64 / 100.0;
                Sample::new(timestamp, value)
            })
            .collect();
        storage.insert_samples(id, samples);
    }

    for (host, region, per_minute) in [("a", "us", 720.0), ("b", "us", 420.0), ("c", "eu", 180.0)]
    {
        let id = catalog.register_series(
            "requests_total",
            Labels::new().with("host", host).with("region", region),
        );
        let samples = (0..60)
            .map(|i| {
                let timestamp = now - (59 - i) * 60 * NANOS_PER_SECOND;
                Sample::new(timestamp, per_minute * i as f64)
            })
            .collect();
        storage.insert_samples(id, samples);
    }

    (Arc::new(catalog), Arc::new(storage))
}
