//! Performance metrics collection for the query engine
//!
//! This module provides functionality for collecting and exposing performance
//! metrics in Prometheus format.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize the metrics collection system
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    // Create a Prometheus exporter
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record the start of one query
pub fn record_query_started() {
    counter!("tsql.queries.started").increment(1);
}

/// Record a completed query with its duration and output size
pub fn record_query_completed(elapsed: Duration, series: usize, samples: usize) {
    counter!("tsql.queries.completed").increment(1);
    counter!("tsql.result.series").increment(series as u64);
    counter!("tsql.result.samples").increment(samples as u64);
    histogram!("tsql.query.duration_ms").record(elapsed.as_secs_f64() * 1000.0);
}

/// Record a failed query, labeled by the stage that rejected it
pub fn record_query_failed(stage: &'static str) {
    counter!("tsql.queries.failed", "stage" => stage).increment(1);
}

/// Record time spent compiling (lex, parse, resolve, plan)
pub fn record_compile_duration(elapsed: Duration) {
    histogram!("tsql.compile.duration_ms").record(elapsed.as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_a_noop() {
        // With no recorder installed these must not panic.
        record_query_started();
        record_compile_duration(Duration::from_millis(2));
        record_query_completed(Duration::from_millis(5), 2, 10);
        record_query_failed("parse");
    }
}
