//! Query pipeline for tsql
//! Lexing, parsing, resolution, planning, and demand-pull execution.

pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use crate::metrics::{
    record_compile_duration, record_query_completed, record_query_failed, record_query_started,
};
use crate::query::executor::{
    execute, CancelToken, ExecutionConfig, ExecutionError, ResultStream,
};
use crate::query::parser::{LexError, Lexer, ParseError, Parser};
use crate::query::planner::{plan, ExplainReport, PhysicalPlan, PlanError};
use crate::query::resolver::{ResolveError, Resolver};
use crate::storage::catalog::Catalog;
use crate::storage::reader::StorageReader;
use crate::storage::series::{SeriesFrame, NANOS_PER_SECOND};

/// Umbrella error for the whole pipeline, so callers match one type.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Lex error: {0}")]
    Lex(#[from] LexError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// Name of the pipeline stage that rejected the query.
    pub fn stage(&self) -> &'static str {
        match self {
            QueryError::Lex(_) => "lex",
            QueryError::Parse(_) => "parse",
            QueryError::Resolve(_) => "resolve",
            QueryError::Plan(_) => "plan",
            QueryError::Execution(_) => "execute",
            QueryError::Timeout(_) => "timeout",
        }
    }
}

/// Configuration for the query engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for one driven query
    pub timeout: Duration,
    /// Estimated point count above which combine sides drain in parallel
    pub parallel_threshold: u64,
    /// Evaluation window when the query has no range suffix, in nanoseconds
    pub default_window: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            parallel_threshold: 100_000,
            default_window: 3600 * NANOS_PER_SECOND, // last hour
        }
    }
}

impl EngineConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: u64) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_default_window(mut self, nanos: i64) -> Self {
        self.default_window = nanos;
        self
    }
}

/// Owns the pipeline collaborators and drives queries end to end.
pub struct QueryEngine {
    catalog: Arc<dyn Catalog>,
    reader: Arc<dyn StorageReader>,
    config: EngineConfig,
}

impl QueryEngine {
    pub fn new(catalog: Arc<dyn Catalog>, reader: Arc<dyn StorageReader>) -> Self {
        Self::with_config(catalog, reader, EngineConfig::default())
    }

    pub fn with_config(
        catalog: Arc<dyn Catalog>,
        reader: Arc<dyn StorageReader>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            reader,
            config,
        }
    }

    /// Lexes, parses, resolves and plans a query without executing it.
    pub fn compile(&self, query: &str) -> Result<PhysicalPlan, QueryError> {
        let started = Instant::now();
        let tokens = Lexer::new(query).tokenize()?;
        debug!("Lexed query: tokens={}", tokens.len());
        let expr = Parser::new(&tokens).parse()?;
        let resolved = Resolver::new(self.catalog.as_ref())
            .with_default_window(self.config.default_window)
            .resolve(&expr)?;
        let plan = plan(&resolved)?;
        record_compile_duration(started.elapsed());
        Ok(plan)
    }

    /// Starts a compiled plan, returning its lazy result stream.
    pub fn execute(&self, plan: &PhysicalPlan, token: CancelToken) -> ResultStream {
        let config = ExecutionConfig {
            parallel_threshold: self.config.parallel_threshold,
        };
        execute(plan, Arc::clone(&self.reader), token, &config)
    }

    /// Compiles and starts a query in one call.
    pub fn run(&self, query: &str, token: CancelToken) -> Result<ResultStream, QueryError> {
        let plan = self.compile(query)?;
        Ok(self.execute(&plan, token))
    }

    /// Compiles a query and renders its plan without executing it.
    pub fn explain(&self, query: &str) -> Result<ExplainReport, QueryError> {
        Ok(self.compile(query)?.explain())
    }

    /// Drives a query to completion on a blocking worker, enforcing the
    /// configured timeout. The pipeline is cancelled when the timeout fires.
    pub async fn run_collect(&self, query: &str) -> Result<Vec<SeriesFrame>, QueryError> {
        let query_id = Uuid::new_v4();
        let span = info_span!("query", id = %query_id);
        let started = Instant::now();
        record_query_started();

        let compiled = span.in_scope(|| {
            debug!("Running query: {}", query);
            self.compile(query)
        });
        let plan = match compiled {
            Ok(plan) => plan,
            Err(err) => {
                record_query_failed(err.stage());
                span.in_scope(|| info!("Query rejected: {}", err));
                return Err(err);
            }
        };

        let token = CancelToken::new();
        let worker_token = token.clone();
        let worker_span = span.clone();
        let reader = Arc::clone(&self.reader);
        let config = ExecutionConfig {
            parallel_threshold: self.config.parallel_threshold,
        };
        let drive = tokio::task::spawn_blocking(move || {
            let _entered = worker_span.enter();
            execute(&plan, reader, worker_token, &config).collect_frames()
        });

        // Execute with timeout
        let timeout = tokio::time::sleep(self.config.timeout);
        tokio::pin!(timeout);

        let result = tokio::select! {
            joined = drive => match joined {
                Ok(frames) => frames.map_err(QueryError::from),
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            },
            _ = timeout.as_mut() => {
                token.cancel();
                Err(QueryError::Timeout(self.config.timeout))
            }
        };

        match &result {
            Ok(frames) => {
                let samples: usize = frames.iter().map(|f| f.samples.len()).sum();
                record_query_completed(started.elapsed(), frames.len(), samples);
                span.in_scope(|| {
                    info!(
                        "Query completed: series={} samples={} elapsed={:?}",
                        frames.len(),
                        samples,
                        started.elapsed()
                    )
                });
            }
            Err(err) => {
                record_query_failed(err.stage());
                span.in_scope(|| info!("Query failed: {}", err));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::MemoryCatalog;
    use crate::storage::reader::{MemoryStorage, ReadError, SampleIter};
    use crate::storage::series::{Labels, Sample, SeriesId, Timestamp};

    const FIXED_NOW: Timestamp = 1_000_000 * NANOS_PER_SECOND;
    const WINDOW_START: Timestamp = FIXED_NOW - 3600 * NANOS_PER_SECOND;

    fn at(seconds: i64) -> Timestamp {
        WINDOW_START + seconds * NANOS_PER_SECOND
    }

    fn seeded_engine() -> QueryEngine {
        let catalog = MemoryCatalog::new().with_now(FIXED_NOW);
        catalog.register_metric("cpu_usage", 15 * NANOS_PER_SECOND);
        let a = catalog.register_series(
            "cpu_usage",
            Labels::new().with("host", "a").with("region", "us"),
        );
        let b = catalog.register_series(
            "cpu_usage",
            Labels::new().with("host", "b").with("region", "eu"),
        );

        let storage = MemoryStorage::new();
        storage.insert_samples(a, vec![Sample::new(at(0), 1.0), Sample::new(at(15), 2.0)]);
        storage.insert_samples(b, vec![Sample::new(at(0), 10.0), Sample::new(at(15), 20.0)]);

        QueryEngine::new(Arc::new(catalog), Arc::new(storage))
    }

    #[tokio::test]
    async fn test_run_collect_end_to_end() {
        let engine = seeded_engine();
        let frames = engine.run_collect("sum(cpu_usage) by (region)").await.unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].labels, Labels::new().with("region", "eu"));
        assert_eq!(
            frames[0].samples,
            vec![Sample::new(at(0), 10.0), Sample::new(at(15), 20.0)]
        );
        assert_eq!(frames[1].labels, Labels::new().with("region", "us"));
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_the_engine() {
        let engine = Arc::new(seeded_engine());
        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_collect("sum(cpu_usage)").await })
        };
        let second = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_collect("topk(1, cpu_usage)").await })
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().unwrap().len(), 1);
        assert_eq!(second.unwrap().unwrap().len(), 1);
    }

    /// Reader that blocks long enough for any timeout to fire first.
    struct SlowReader;

    impl StorageReader for SlowReader {
        fn open(
            &self,
            _series: SeriesId,
            _start: Timestamp,
            _end: Timestamp,
        ) -> Result<SampleIter, ReadError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_slow_queries() {
        let catalog = MemoryCatalog::new().with_now(FIXED_NOW);
        catalog.register_metric("cpu_usage", 15 * NANOS_PER_SECOND);
        catalog.register_series("cpu_usage", Labels::new().with("host", "a"));
        catalog.register_series("cpu_usage", Labels::new().with("host", "b"));

        let config = EngineConfig::default().with_timeout(Duration::from_millis(50));
        let engine = QueryEngine::with_config(Arc::new(catalog), Arc::new(SlowReader), config);

        let result = engine.run_collect("cpu_usage").await;
        assert!(matches!(result, Err(QueryError::Timeout(_))));
    }

    #[test]
    fn test_compile_errors_carry_their_stage() {
        let engine = seeded_engine();

        let err = engine.compile("cpu_usage{host=\"a\"").unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
        assert_eq!(err.stage(), "parse");

        let err = engine.compile("nonexistent_metric").unwrap_err();
        assert!(matches!(err, QueryError::Resolve(_)));
        assert_eq!(err.stage(), "resolve");

        let err = engine.compile("1 + 2").unwrap_err();
        assert!(matches!(err, QueryError::Plan(_)));
        assert_eq!(err.stage(), "plan");

        let err = engine.compile("cpu_usage{host=\"a\" @").unwrap_err();
        assert!(matches!(err, QueryError::Lex(_)));
        assert_eq!(err.stage(), "lex");
    }

    #[test]
    fn test_run_streams_lazily() {
        let engine = seeded_engine();
        let mut stream = engine
            .run("sort(cpu_usage)", CancelToken::new())
            .unwrap();

        let first = stream.next_series().unwrap().unwrap();
        let second = stream.next_series().unwrap().unwrap();
        assert!(first.last_value().unwrap() <= second.last_value().unwrap());
        assert!(stream.next_series().unwrap().is_none());
    }

    #[test]
    fn test_explain_renders_the_plan() {
        let engine = seeded_engine();
        let report = engine.explain("sum(rate(cpu_usage)) by (region)").unwrap();
        assert_eq!(report.root.operator, "aggregate");
        assert_eq!(report.root.children[0].operator, "downsample");
        assert_eq!(report.root.children[0].children[0].operator, "scan");
    }
}
