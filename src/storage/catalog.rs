use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use regex::Regex;
use tracing::debug;

use crate::storage::series::{Labels, SeriesId, Timestamp, NANOS_PER_SECOND};

/// Default sampling interval assumed for metrics registered without one.
pub const DEFAULT_NATIVE_STEP: i64 = 60 * NANOS_PER_SECOND;

/// How a label matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    Neq,
    Re,
    NotRe,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            MatchOp::Eq => "=",
            MatchOp::Neq => "!=",
            MatchOp::Re => "=~",
            MatchOp::NotRe => "!~",
        };
        write!(f, "{}", symbol)
    }
}

/// A predicate over one label, used to select series within a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    /// Label name the predicate applies to
    pub label: String,
    /// Comparison operator
    pub op: MatchOp,
    /// Literal value or regex pattern
    pub value: String,
}

impl LabelMatcher {
    pub fn new(label: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            op,
            value: value.into(),
        }
    }

    /// True for plain equality, the only form index lookups push down fully.
    pub fn is_equality(&self) -> bool {
        self.op == MatchOp::Eq
    }

    /// Compiles the matcher for repeated evaluation. Regex patterns are
    /// fully anchored, so `"us"` matches exactly `us` and not `us-east`.
    pub fn compile(&self) -> Result<CompiledMatcher, regex::Error> {
        let re = match self.op {
            MatchOp::Re | MatchOp::NotRe => Some(Regex::new(&format!("^(?:{})$", self.value))?),
            MatchOp::Eq | MatchOp::Neq => None,
        };
        Ok(CompiledMatcher {
            label: self.label.clone(),
            op: self.op,
            value: self.value.clone(),
            re,
        })
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.label, self.op, self.value)
    }
}

/// A matcher with its regex pattern compiled once.
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    label: String,
    op: MatchOp,
    value: String,
    re: Option<Regex>,
}

impl CompiledMatcher {
    /// Evaluates the predicate against a label set. A missing label reads
    /// as the empty string, so negative matchers select unlabeled series.
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.value_or_empty(&self.label);
        match self.op {
            MatchOp::Eq => value == self.value,
            MatchOp::Neq => value != self.value,
            MatchOp::Re => self.re.as_ref().map_or(false, |re| re.is_match(value)),
            MatchOp::NotRe => !self.re.as_ref().map_or(false, |re| re.is_match(value)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_equality(&self) -> bool {
        self.op == MatchOp::Eq
    }
}

impl fmt::Display for CompiledMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.label, self.op, self.value)
    }
}

/// Metadata the catalog stores per metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricInfo {
    /// Metric name
    pub name: String,
    /// Native sampling interval in nanoseconds
    pub native_step: i64,
}

/// One series as the catalog knows it: its identifier and label set.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesEntry {
    pub id: SeriesId,
    pub labels: Labels,
}

/// Read-side metadata interface consumed during resolution.
///
/// Implementations must behave as an immutable snapshot for the duration of
/// one resolve call. Matcher patterns are validated before lookup, so
/// `lookup` never reports pattern errors.
pub trait Catalog: Send + Sync {
    /// Returns metadata for a metric, or None if the metric is unknown.
    fn metric(&self, name: &str) -> Option<MetricInfo>;

    /// Returns the series of a metric matching every matcher. Empty when
    /// the matchers exclude everything; unknown metrics also yield empty.
    fn lookup(&self, metric: &str, matchers: &[LabelMatcher]) -> Vec<SeriesEntry>;

    /// Current wall-clock time in nanoseconds, the anchor for relative
    /// time expressions.
    fn now(&self) -> Timestamp;
}

struct MetricRecord {
    info: MetricInfo,
    series: Vec<SeriesEntry>,
}

/// In-memory catalog backing tests and the interactive shell.
pub struct MemoryCatalog {
    metrics: RwLock<HashMap<String, MetricRecord>>,
    next_id: AtomicU64,
    fixed_now: RwLock<Option<Timestamp>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fixed_now: RwLock::new(None),
        }
    }

    /// Pins `now()` to a fixed timestamp, making resolution reproducible.
    pub fn with_now(self, now: Timestamp) -> Self {
        *self.fixed_now.write().unwrap() = Some(now);
        self
    }

    pub fn set_now(&self, now: Timestamp) {
        *self.fixed_now.write().unwrap() = Some(now);
    }

    /// Registers a metric with the given native step in nanoseconds.
    pub fn register_metric(&self, name: impl Into<String>, native_step: i64) {
        let name = name.into();
        // Non-positive steps fall back to the default.
        let native_step = if native_step > 0 {
            native_step
        } else {
            DEFAULT_NATIVE_STEP
        };
        let mut metrics = self.metrics.write().unwrap();
        metrics
            .entry(name.clone())
            .or_insert_with(|| MetricRecord {
                info: MetricInfo {
                    name: name.clone(),
                    native_step,
                },
                series: Vec::new(),
            })
            .info
            .native_step = native_step;
        debug!("Registered metric: name={}, step={}ns", name, native_step);
    }

    /// Registers a series under a metric, creating the metric with the
    /// default native step if it was never registered.
    pub fn register_series(&self, metric: &str, labels: Labels) -> SeriesId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut metrics = self.metrics.write().unwrap();
        let record = metrics
            .entry(metric.to_string())
            .or_insert_with(|| MetricRecord {
                info: MetricInfo {
                    name: metric.to_string(),
                    native_step: DEFAULT_NATIVE_STEP,
                },
                series: Vec::new(),
            });
        record.series.push(SeriesEntry { id, labels });
        debug!("Registered series: metric={}, id={}", metric, id);
        id
    }

    /// Total number of series across all metrics.
    pub fn series_count(&self) -> usize {
        let metrics = self.metrics.read().unwrap();
        metrics.values().map(|r| r.series.len()).sum()
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for MemoryCatalog {
    fn metric(&self, name: &str) -> Option<MetricInfo> {
        let metrics = self.metrics.read().unwrap();
        metrics.get(name).map(|r| r.info.clone())
    }

    fn lookup(&self, metric: &str, matchers: &[LabelMatcher]) -> Vec<SeriesEntry> {
        let metrics = self.metrics.read().unwrap();
        let record = match metrics.get(metric) {
            Some(record) => record,
            None => return Vec::new(),
        };

        let compiled: Vec<CompiledMatcher> =
            matchers.iter().filter_map(|m| m.compile().ok()).collect();

        record
            .series
            .iter()
            .filter(|entry| compiled.iter().all(|m| m.matches(&entry.labels)))
            .cloned()
            .collect()
    }

    fn now(&self) -> Timestamp {
        if let Some(now) = *self.fixed_now.read().unwrap() {
            return now;
        }
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new().with_now(1_000_000_000_000);
        catalog.register_metric("cpu_usage", 15 * NANOS_PER_SECOND);
        catalog.register_series("cpu_usage", Labels::new().with("host", "a").with("region", "us"));
        catalog.register_series("cpu_usage", Labels::new().with("host", "b").with("region", "eu"));
        catalog.register_series("cpu_usage", Labels::new().with("host", "c"));
        catalog
    }

    #[test]
    fn test_metric_lookup() {
        let catalog = seeded_catalog();
        let info = catalog.metric("cpu_usage").unwrap();
        assert_eq!(info.native_step, 15 * NANOS_PER_SECOND);
        assert!(catalog.metric("nonexistent_metric").is_none());
    }

    #[test]
    fn test_lookup_with_equality_matcher() {
        let catalog = seeded_catalog();
        let matchers = [LabelMatcher::new("host", MatchOp::Eq, "a")];
        let entries = catalog.lookup("cpu_usage", &matchers);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].labels.get("region"), Some("us"));
    }

    #[test]
    fn test_lookup_with_regex_matcher() {
        let catalog = seeded_catalog();
        let matchers = [LabelMatcher::new("host", MatchOp::Re, "a|b")];
        let entries = catalog.lookup("cpu_usage", &matchers);
        assert_eq!(entries.len(), 2);

        // Anchored: the pattern must cover the whole value.
        let matchers = [LabelMatcher::new("region", MatchOp::Re, "u")];
        assert!(catalog.lookup("cpu_usage", &matchers).is_empty());
    }

    #[test]
    fn test_negative_matchers_select_unlabeled_series() {
        let catalog = seeded_catalog();
        let matchers = [LabelMatcher::new("region", MatchOp::Neq, "us")];
        let entries = catalog.lookup("cpu_usage", &matchers);
        // host=b (region=eu) and host=c (no region label).
        assert_eq!(entries.len(), 2);

        let matchers = [LabelMatcher::new("region", MatchOp::NotRe, ".+")];
        let entries = catalog.lookup("cpu_usage", &matchers);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].labels.get("host"), Some("c"));
    }

    #[test]
    fn test_lookup_unknown_metric_is_empty() {
        let catalog = seeded_catalog();
        assert!(catalog.lookup("nonexistent_metric", &[]).is_empty());
    }

    #[test]
    fn test_fixed_now() {
        let catalog = seeded_catalog();
        assert_eq!(catalog.now(), 1_000_000_000_000);
        catalog.set_now(5);
        assert_eq!(catalog.now(), 5);
    }

    #[test]
    fn test_series_count_spans_metrics() {
        let catalog = seeded_catalog();
        assert_eq!(catalog.series_count(), 3);
        catalog.register_series("requests_total", Labels::new().with("host", "a"));
        assert_eq!(catalog.series_count(), 4);
    }
}
