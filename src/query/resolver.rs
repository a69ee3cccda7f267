use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::query::parser::ast::{
    BinOp, Expr, FunctionCall, Grouping, Literal, MetricSelector, TimeBound, TimeRangeSpec,
};
use crate::storage::catalog::{
    Catalog, CompiledMatcher, LabelMatcher, SeriesEntry, DEFAULT_NATIVE_STEP,
};
use crate::storage::series::{Timestamp, NANOS_PER_SECOND};

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Function {function} expects {expected} argument(s), found {found}")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("Bad argument to {function}: {reason}")]
    BadArgument { function: String, reason: String },
    #[error("Function {0} does not accept a grouping clause")]
    GroupingNotAllowed(String),
    #[error("Invalid time range: {0}")]
    InvalidRange(String),
    #[error("Invalid regular expression for label {label}: {reason}")]
    InvalidRegex { label: String, reason: String },
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
}

/// Aggregation operators shared by aggregate calls and downsampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateOp {
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
        }
    }
}

/// The absolute evaluation window, in nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: i64,
}

impl TimeWindow {
    /// Number of emission points `start + k * step` that fall inside the
    /// window, end inclusive. Resolution only produces windows with a
    /// positive step; hand-built windows must uphold that.
    pub fn points(&self) -> i64 {
        debug_assert!(self.step > 0, "Window step must be positive");
        (self.end - self.start) / self.step + 1
    }
}

/// A fully resolved query: every name bound against the catalog and the
/// evaluation window made absolute.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub root: ResolvedExpr,
    pub window: TimeWindow,
}

#[derive(Debug, Clone)]
pub enum ResolvedExpr {
    Selector(ResolvedSelector),
    Aggregate(ResolvedAggregate),
    Rate(Box<ResolvedExpr>),
    Sort {
        descending: bool,
        input: Box<ResolvedExpr>,
    },
    Rank {
        count: usize,
        descending: bool,
        input: Box<ResolvedExpr>,
    },
    Binary(ResolvedBinary),
    Number(f64),
}

/// A selector bound to concrete series. `compiled` holds the matchers with
/// their regexes built, validated during resolution.
#[derive(Debug, Clone)]
pub struct ResolvedSelector {
    pub metric: String,
    pub matchers: Vec<LabelMatcher>,
    pub compiled: Vec<CompiledMatcher>,
    pub series: Vec<SeriesEntry>,
    pub native_step: i64,
}

#[derive(Debug, Clone)]
pub struct ResolvedAggregate {
    pub op: AggregateOp,
    pub grouping: Grouping,
    pub input: Box<ResolvedExpr>,
}

#[derive(Debug, Clone)]
pub struct ResolvedBinary {
    pub op: BinOp,
    pub lhs: Box<ResolvedExpr>,
    pub rhs: Box<ResolvedExpr>,
}

/// True when the expression evaluates to a plain number rather than series.
pub fn is_scalar(expr: &ResolvedExpr) -> bool {
    match expr {
        ResolvedExpr::Number(_) => true,
        ResolvedExpr::Binary(binary) => is_scalar(&binary.lhs) && is_scalar(&binary.rhs),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
enum FunctionKind {
    Aggregate(AggregateOp),
    Rate,
    Sort { descending: bool },
    Rank { descending: bool },
}

#[derive(Debug, Clone, Copy)]
struct FunctionSpec {
    kind: FunctionKind,
    arity: usize,
    allows_grouping: bool,
}

fn function_spec(name: &str) -> Option<FunctionSpec> {
    let aggregate = |op| FunctionSpec {
        kind: FunctionKind::Aggregate(op),
        arity: 1,
        allows_grouping: true,
    };
    let spec = match name {
        "sum" => aggregate(AggregateOp::Sum),
        "avg" => aggregate(AggregateOp::Avg),
        "min" => aggregate(AggregateOp::Min),
        "max" => aggregate(AggregateOp::Max),
        "count" => aggregate(AggregateOp::Count),
        "rate" => FunctionSpec {
            kind: FunctionKind::Rate,
            arity: 1,
            allows_grouping: false,
        },
        "sort" => FunctionSpec {
            kind: FunctionKind::Sort { descending: false },
            arity: 1,
            allows_grouping: false,
        },
        "sort_desc" => FunctionSpec {
            kind: FunctionKind::Sort { descending: true },
            arity: 1,
            allows_grouping: false,
        },
        "topk" => FunctionSpec {
            kind: FunctionKind::Rank { descending: true },
            arity: 2,
            allows_grouping: false,
        },
        "bottomk" => FunctionSpec {
            kind: FunctionKind::Rank { descending: false },
            arity: 2,
            allows_grouping: false,
        },
        _ => return None,
    };
    Some(spec)
}

/// Binds a parsed expression against the catalog: metric and function names
/// are checked, matcher regexes compiled, series enumerated, and relative
/// time bounds anchored to the catalog clock.
pub struct Resolver<'a> {
    catalog: &'a dyn Catalog,
    default_window: i64,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self {
            catalog,
            default_window: 3600 * NANOS_PER_SECOND,
        }
    }

    /// Window duration used when the query carries no range suffix.
    pub fn with_default_window(mut self, nanos: i64) -> Self {
        self.default_window = nanos;
        self
    }

    pub fn resolve(&self, expr: &Expr) -> Result<ResolvedQuery, ResolveError> {
        let (root, range_spec) = match expr {
            Expr::Range(range) => (range.expr.as_ref(), Some(range.range)),
            other => (other, None),
        };
        let mut native_steps = Vec::new();
        let resolved = self.resolve_expr(root, &mut native_steps)?;
        let window = self.resolve_window(range_spec, &native_steps)?;
        debug!(
            "Resolved query over [{}, {}] step {}",
            window.start, window.end, window.step
        );
        Ok(ResolvedQuery {
            root: resolved,
            window,
        })
    }

    fn resolve_expr(
        &self,
        expr: &Expr,
        native_steps: &mut Vec<i64>,
    ) -> Result<ResolvedExpr, ResolveError> {
        match expr {
            Expr::Selector(selector) => Ok(ResolvedExpr::Selector(
                self.resolve_selector(selector, native_steps)?,
            )),
            Expr::Call(call) => self.resolve_call(call, native_steps),
            Expr::Binary(binary) => {
                let lhs = self.resolve_expr(&binary.lhs, native_steps)?;
                let rhs = self.resolve_expr(&binary.rhs, native_steps)?;
                Ok(ResolvedExpr::Binary(ResolvedBinary {
                    op: binary.op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }))
            }
            Expr::Range(_) => Err(ResolveError::InvalidRange(
                "A time range may only be applied to the whole query".to_string(),
            )),
            Expr::Literal(Literal::Number(value)) => Ok(ResolvedExpr::Number(*value)),
            Expr::Literal(Literal::Str(_)) => Err(ResolveError::TypeMismatch(
                "String literals cannot be evaluated".to_string(),
            )),
        }
    }

    fn resolve_selector(
        &self,
        selector: &MetricSelector,
        native_steps: &mut Vec<i64>,
    ) -> Result<ResolvedSelector, ResolveError> {
        let info = self
            .catalog
            .metric(&selector.metric)
            .ok_or_else(|| ResolveError::UnknownMetric(selector.metric.clone()))?;
        let mut compiled = Vec::with_capacity(selector.matchers.len());
        for matcher in &selector.matchers {
            let built = matcher.compile().map_err(|e| ResolveError::InvalidRegex {
                label: matcher.label.clone(),
                reason: e.to_string(),
            })?;
            compiled.push(built);
        }
        let series = self.catalog.lookup(&selector.metric, &selector.matchers);
        debug!(
            "Selector {} matched {} series",
            selector.metric,
            series.len()
        );
        native_steps.push(info.native_step);
        Ok(ResolvedSelector {
            metric: selector.metric.clone(),
            matchers: selector.matchers.clone(),
            compiled,
            series,
            native_step: info.native_step,
        })
    }

    fn resolve_call(
        &self,
        call: &FunctionCall,
        native_steps: &mut Vec<i64>,
    ) -> Result<ResolvedExpr, ResolveError> {
        let spec =
            function_spec(&call.name).ok_or_else(|| ResolveError::UnknownFunction(call.name.clone()))?;
        if call.args.len() != spec.arity {
            return Err(ResolveError::ArityMismatch {
                function: call.name.clone(),
                expected: spec.arity,
                found: call.args.len(),
            });
        }
        if call.grouping.is_some() && !spec.allows_grouping {
            return Err(ResolveError::GroupingNotAllowed(call.name.clone()));
        }
        match spec.kind {
            FunctionKind::Aggregate(op) => {
                let input = self.resolve_series_arg(&call.name, &call.args[0], native_steps)?;
                let grouping = call
                    .grouping
                    .clone()
                    .unwrap_or_else(|| Grouping::By(Vec::new()));
                Ok(ResolvedExpr::Aggregate(ResolvedAggregate {
                    op,
                    grouping,
                    input: Box::new(input),
                }))
            }
            FunctionKind::Rate => {
                let input = self.resolve_series_arg(&call.name, &call.args[0], native_steps)?;
                Ok(ResolvedExpr::Rate(Box::new(input)))
            }
            FunctionKind::Sort { descending } => {
                let input = self.resolve_series_arg(&call.name, &call.args[0], native_steps)?;
                Ok(ResolvedExpr::Sort {
                    descending,
                    input: Box::new(input),
                })
            }
            FunctionKind::Rank { descending } => {
                let count = rank_count(&call.name, &call.args[0])?;
                let input = self.resolve_series_arg(&call.name, &call.args[1], native_steps)?;
                Ok(ResolvedExpr::Rank {
                    count,
                    descending,
                    input: Box::new(input),
                })
            }
        }
    }

    fn resolve_series_arg(
        &self,
        function: &str,
        arg: &Expr,
        native_steps: &mut Vec<i64>,
    ) -> Result<ResolvedExpr, ResolveError> {
        let resolved = self.resolve_expr(arg, native_steps)?;
        if is_scalar(&resolved) {
            return Err(ResolveError::BadArgument {
                function: function.to_string(),
                reason: "expects a series-valued argument".to_string(),
            });
        }
        Ok(resolved)
    }

    fn resolve_window(
        &self,
        spec: Option<TimeRangeSpec>,
        native_steps: &[i64],
    ) -> Result<TimeWindow, ResolveError> {
        let now = self.catalog.now();
        let (start, end) = match spec {
            Some(spec) => (
                bound_to_timestamp(spec.start, now),
                bound_to_timestamp(spec.end, now),
            ),
            None => (now - self.default_window, now),
        };
        if start >= end {
            return Err(ResolveError::InvalidRange(format!(
                "Window start {} is not before end {}",
                start, end
            )));
        }
        let step = match spec.and_then(|spec| spec.step) {
            Some(step) => step,
            // The coarsest native step keeps mixed-resolution queries from
            // oversampling the slowest metric.
            None => native_steps
                .iter()
                .copied()
                .max()
                .unwrap_or(DEFAULT_NATIVE_STEP),
        };
        if step <= 0 {
            return Err(ResolveError::InvalidRange(format!(
                "Step must be positive, got {}",
                step
            )));
        }
        Ok(TimeWindow { start, end, step })
    }
}

fn bound_to_timestamp(bound: TimeBound, now: Timestamp) -> Timestamp {
    match bound {
        TimeBound::Now => now,
        TimeBound::Offset(nanos) => now - nanos,
        TimeBound::At(timestamp) => timestamp,
    }
}

fn rank_count(function: &str, arg: &Expr) -> Result<usize, ResolveError> {
    match arg {
        Expr::Literal(Literal::Number(value)) if value.fract() == 0.0 && *value >= 1.0 => {
            Ok(*value as usize)
        }
        _ => Err(ResolveError::BadArgument {
            function: function.to_string(),
            reason: "k must be a positive integer literal".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::{Lexer, Parser};
    use crate::storage::catalog::{MatchOp, MemoryCatalog};
    use crate::storage::series::Labels;

    const FIXED_NOW: Timestamp = 1_000_000_000_000;

    fn seeded_catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new().with_now(FIXED_NOW);
        catalog.register_metric("cpu_usage", 15 * NANOS_PER_SECOND);
        catalog.register_metric("requests_total", 60 * NANOS_PER_SECOND);
        catalog.register_series(
            "cpu_usage",
            Labels::new().with("host", "a").with("region", "us"),
        );
        catalog.register_series(
            "cpu_usage",
            Labels::new().with("host", "b").with("region", "eu"),
        );
        catalog.register_series("cpu_usage", Labels::new().with("host", "c"));
        catalog.register_series("requests_total", Labels::new().with("host", "a"));
        catalog
    }

    fn resolve(input: &str) -> Result<ResolvedQuery, ResolveError> {
        let catalog = seeded_catalog();
        let tokens = Lexer::new(input).tokenize().unwrap();
        let expr = Parser::new(&tokens).parse().unwrap();
        Resolver::new(&catalog).resolve(&expr)
    }

    #[test]
    fn test_resolves_selector_series() {
        let resolved = resolve("cpu_usage{host=\"a\"}").unwrap();
        match &resolved.root {
            ResolvedExpr::Selector(selector) => {
                assert_eq!(selector.series.len(), 1);
                assert_eq!(selector.series[0].labels.get("host"), Some("a"));
                assert_eq!(selector.native_step, 15 * NANOS_PER_SECOND);
            }
            other => panic!("Expected selector, got {:?}", other),
        }
    }

    #[test]
    fn test_default_window_uses_native_step() {
        let resolved = resolve("cpu_usage").unwrap();
        assert_eq!(
            resolved.window,
            TimeWindow {
                start: FIXED_NOW - 3600 * NANOS_PER_SECOND,
                end: FIXED_NOW,
                step: 15 * NANOS_PER_SECOND,
            }
        );
    }

    #[test]
    fn test_coarsest_native_step_wins() {
        let resolved = resolve("cpu_usage + requests_total").unwrap();
        assert_eq!(resolved.window.step, 60 * NANOS_PER_SECOND);
    }

    #[test]
    fn test_explicit_window_is_anchored() {
        let resolved = resolve("cpu_usage[now-30m:now:30s]").unwrap();
        assert_eq!(
            resolved.window,
            TimeWindow {
                start: FIXED_NOW - 1800 * NANOS_PER_SECOND,
                end: FIXED_NOW,
                step: 30 * NANOS_PER_SECOND,
            }
        );
    }

    #[test]
    fn test_unknown_metric_is_reported_early() {
        assert_eq!(
            resolve("nope").unwrap_err(),
            ResolveError::UnknownMetric("nope".to_string())
        );
        assert_eq!(
            resolve("sum(rate(nope))").unwrap_err(),
            ResolveError::UnknownMetric("nope".to_string())
        );
    }

    #[test]
    fn test_unknown_function() {
        assert_eq!(
            resolve("irate(cpu_usage)").unwrap_err(),
            ResolveError::UnknownFunction("irate".to_string())
        );
    }

    #[test]
    fn test_arity_checked_before_arguments() {
        assert_eq!(
            resolve("sum(cpu_usage, nope)").unwrap_err(),
            ResolveError::ArityMismatch {
                function: "sum".to_string(),
                expected: 1,
                found: 2,
            }
        );
        assert_eq!(
            resolve("topk(cpu_usage)").unwrap_err(),
            ResolveError::ArityMismatch {
                function: "topk".to_string(),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn test_grouping_rules() {
        assert_eq!(
            resolve("rate(cpu_usage) by (host)").unwrap_err(),
            ResolveError::GroupingNotAllowed("rate".to_string())
        );

        let resolved = resolve("sum(cpu_usage)").unwrap();
        match &resolved.root {
            ResolvedExpr::Aggregate(aggregate) => {
                assert_eq!(aggregate.op, AggregateOp::Sum);
                assert_eq!(aggregate.grouping, Grouping::By(Vec::new()));
            }
            other => panic!("Expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_rank_count_validation() {
        let resolved = resolve("topk(3, cpu_usage)").unwrap();
        match &resolved.root {
            ResolvedExpr::Rank {
                count, descending, ..
            } => {
                assert_eq!(*count, 3);
                assert!(*descending);
            }
            other => panic!("Expected rank, got {:?}", other),
        }

        for query in ["topk(0, cpu_usage)", "topk(2.5, cpu_usage)", "topk(-1, cpu_usage)"] {
            assert!(matches!(
                resolve(query).unwrap_err(),
                ResolveError::BadArgument { .. }
            ));
        }
    }

    #[test]
    fn test_scalar_arguments_rejected() {
        assert!(matches!(
            resolve("sum(5)").unwrap_err(),
            ResolveError::BadArgument { .. }
        ));
        assert!(matches!(
            resolve("rate(1 + 2)").unwrap_err(),
            ResolveError::BadArgument { .. }
        ));
    }

    #[test]
    fn test_invalid_windows() {
        assert!(matches!(
            resolve("cpu_usage[now:now-1h]").unwrap_err(),
            ResolveError::InvalidRange(_)
        ));
        // An empty window is invalid too.
        assert!(matches!(
            resolve("cpu_usage[now:now]").unwrap_err(),
            ResolveError::InvalidRange(_)
        ));
        assert!(matches!(
            resolve("cpu_usage[now-1h:now:0s]").unwrap_err(),
            ResolveError::InvalidRange(_)
        ));
    }

    #[test]
    #[should_panic(expected = "Window step must be positive")]
    fn test_window_points_requires_positive_step() {
        let window = TimeWindow {
            start: 0,
            end: 10,
            step: 0,
        };
        window.points();
    }

    #[test]
    fn test_nested_range_rejected() {
        assert!(matches!(
            resolve("sum(cpu_usage[now-1h:now])").unwrap_err(),
            ResolveError::InvalidRange(_)
        ));
    }

    #[test]
    fn test_invalid_regex_reported_with_label() {
        match resolve("cpu_usage{host=~\"[\"}").unwrap_err() {
            ResolveError::InvalidRegex { label, .. } => assert_eq!(label, "host"),
            other => panic!("Expected regex error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_match_is_not_an_error() {
        let resolved = resolve("cpu_usage{host=\"z\"}").unwrap();
        match &resolved.root {
            ResolvedExpr::Selector(selector) => assert!(selector.series.is_empty()),
            other => panic!("Expected selector, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_label_matches_empty_string() {
        // host=c carries no region label, so region="" selects it.
        let resolved = resolve("cpu_usage{region=\"\"}").unwrap();
        match &resolved.root {
            ResolvedExpr::Selector(selector) => {
                assert_eq!(selector.series.len(), 1);
                assert_eq!(selector.series[0].labels.get("host"), Some("c"));
            }
            other => panic!("Expected selector, got {:?}", other),
        }
    }

    #[test]
    fn test_resolution_is_deterministic_with_fixed_clock() {
        let catalog = seeded_catalog();
        let tokens = Lexer::new("sum(cpu_usage{host=~\"a|b\"}) by (region)")
            .tokenize()
            .unwrap();
        let expr = Parser::new(&tokens).parse().unwrap();
        let resolver = Resolver::new(&catalog);
        let first = resolver.resolve(&expr).unwrap();
        let second = resolver.resolve(&expr).unwrap();
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
        assert_eq!(first.window, second.window);
    }

    #[test]
    fn test_matcher_ops_preserved() {
        let resolved = resolve("cpu_usage{host!=\"a\",region=~\"us|eu\"}").unwrap();
        match &resolved.root {
            ResolvedExpr::Selector(selector) => {
                assert_eq!(selector.matchers[0].op, MatchOp::Neq);
                assert_eq!(selector.matchers[1].op, MatchOp::Re);
                // host=b matches: not "a", region "eu". host=c fails the
                // regex since its region reads as empty.
                assert_eq!(selector.series.len(), 1);
            }
            other => panic!("Expected selector, got {:?}", other),
        }
    }
}
