use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::query::parser::ast::{format_duration, BinOp, Grouping};
use crate::query::resolver::{AggregateOp, ResolvedExpr, ResolvedQuery, TimeWindow};
use crate::storage::catalog::{CompiledMatcher, MatchOp, SeriesEntry};

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("Unsupported query shape: {0}")]
    Unsupported(String),
}

/// Cardinality guess attached to every operator: series surviving the
/// operator and the samples it is expected to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub series: usize,
    pub points: u64,
}

/// Bucket reducer used by [`DownsampleNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsampleOp {
    /// Mean of the samples in each bucket; used for step alignment.
    Avg,
    /// Per-second increase across each bucket.
    Rate,
}

impl DownsampleOp {
    pub fn name(self) -> &'static str {
        match self {
            DownsampleOp::Avg => "avg",
            DownsampleOp::Rate => "rate",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlanNode {
    Scan(ScanNode),
    Filter(FilterNode),
    Aggregate(AggregateNode),
    Combine(CombineNode),
    Downsample(DownsampleNode),
    Sort(SortNode),
    Limit(LimitNode),
}

#[derive(Debug, Clone)]
pub struct ScanNode {
    pub metric: String,
    pub series: Vec<SeriesEntry>,
    pub estimate: Estimate,
}

/// Re-applies non-equality matchers against the labels each frame actually
/// carries, so series whose labels drifted since resolution are dropped.
#[derive(Debug, Clone)]
pub struct FilterNode {
    pub matchers: Vec<CompiledMatcher>,
    pub input: Box<PlanNode>,
    pub estimate: Estimate,
}

#[derive(Debug, Clone)]
pub struct AggregateNode {
    pub op: AggregateOp,
    pub grouping: Grouping,
    pub input: Box<PlanNode>,
    pub estimate: Estimate,
}

#[derive(Debug, Clone)]
pub enum CombineSide {
    Plan(Box<PlanNode>),
    Scalar(f64),
}

#[derive(Debug, Clone)]
pub struct CombineNode {
    pub op: BinOp,
    pub lhs: CombineSide,
    pub rhs: CombineSide,
    /// Alignment tolerance when pairing samples from the two sides.
    pub step: i64,
    pub estimate: Estimate,
}

#[derive(Debug, Clone)]
pub struct DownsampleNode {
    pub op: DownsampleOp,
    pub step: i64,
    pub input: Box<PlanNode>,
    pub estimate: Estimate,
}

#[derive(Debug, Clone)]
pub struct SortNode {
    pub descending: bool,
    pub input: Box<PlanNode>,
    pub estimate: Estimate,
}

#[derive(Debug, Clone)]
pub struct LimitNode {
    pub count: usize,
    pub input: Box<PlanNode>,
    pub estimate: Estimate,
}

impl PlanNode {
    pub fn estimate(&self) -> Estimate {
        match self {
            PlanNode::Scan(node) => node.estimate,
            PlanNode::Filter(node) => node.estimate,
            PlanNode::Aggregate(node) => node.estimate,
            PlanNode::Combine(node) => node.estimate,
            PlanNode::Downsample(node) => node.estimate,
            PlanNode::Sort(node) => node.estimate,
            PlanNode::Limit(node) => node.estimate,
        }
    }

    fn explain(&self) -> ExplainNode {
        let estimate = self.estimate();
        let (operator, detail, children) = match self {
            PlanNode::Scan(node) => ("scan", node.metric.clone(), Vec::new()),
            PlanNode::Filter(node) => {
                let matchers: Vec<String> = node.matchers.iter().map(|m| m.to_string()).collect();
                ("filter", matchers.join(","), vec![node.input.explain()])
            }
            PlanNode::Aggregate(node) => {
                let detail = format!("{} {}", node.op.name(), grouping_label(&node.grouping));
                ("aggregate", detail, vec![node.input.explain()])
            }
            PlanNode::Combine(node) => {
                let mut children = Vec::new();
                let mut describe = |side: &CombineSide| match side {
                    CombineSide::Plan(plan) => {
                        children.push(plan.explain());
                        "series".to_string()
                    }
                    CombineSide::Scalar(value) => value.to_string(),
                };
                let detail = format!(
                    "{} {} {}",
                    describe(&node.lhs),
                    node.op.symbol(),
                    describe(&node.rhs)
                );
                ("combine", detail, children)
            }
            PlanNode::Downsample(node) => {
                let detail = format!("{} every {}", node.op.name(), format_duration(node.step));
                ("downsample", detail, vec![node.input.explain()])
            }
            PlanNode::Sort(node) => {
                let detail = if node.descending {
                    "descending"
                } else {
                    "ascending"
                };
                ("sort", detail.to_string(), vec![node.input.explain()])
            }
            PlanNode::Limit(node) => ("limit", node.count.to_string(), vec![node.input.explain()]),
        };
        ExplainNode {
            operator: operator.to_string(),
            detail,
            estimated_series: estimate.series,
            estimated_points: estimate.points,
            children,
        }
    }
}

/// An executable operator tree plus the window it evaluates over.
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    pub root: PlanNode,
    pub window: TimeWindow,
}

impl PhysicalPlan {
    pub fn explain(&self) -> ExplainReport {
        ExplainReport {
            window: self.window,
            root: self.root.explain(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainReport {
    pub window: TimeWindow,
    pub root: ExplainNode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainNode {
    pub operator: String,
    pub detail: String,
    pub estimated_series: usize,
    pub estimated_points: u64,
    pub children: Vec<ExplainNode>,
}

/// Lowers a resolved query to a physical operator tree.
///
/// Scalar subtrees fold into constants during lowering. When the two sides
/// of a combine emit at different steps the finer side is downsampled to the
/// coarser one, and the root is aligned to the window step the same way.
pub fn plan(resolved: &ResolvedQuery) -> Result<PhysicalPlan, PlanError> {
    let window = resolved.window;
    match lower(&resolved.root, &window)? {
        Lowered::Scalar(value) => Err(PlanError::Unsupported(format!(
            "Query evaluates to the constant {}",
            value
        ))),
        Lowered::Series { node, step } => {
            let root = align(node, step, window.step, &window);
            let estimate = root.estimate();
            debug!(
                "Planned query: {} series, {} points estimated",
                estimate.series, estimate.points
            );
            Ok(PhysicalPlan { root, window })
        }
    }
}

enum Lowered {
    Series { node: PlanNode, step: i64 },
    Scalar(f64),
}

fn lower(expr: &ResolvedExpr, window: &TimeWindow) -> Result<Lowered, PlanError> {
    match expr {
        ResolvedExpr::Number(value) => Ok(Lowered::Scalar(*value)),
        ResolvedExpr::Selector(selector) => {
            let series = selector.series.len();
            let scan_estimate = Estimate {
                series,
                points: series as u64 * points_at(window, selector.native_step),
            };
            let mut node = PlanNode::Scan(ScanNode {
                metric: selector.metric.clone(),
                series: selector.series.clone(),
                estimate: scan_estimate,
            });
            let recheck: Vec<CompiledMatcher> = selector
                .compiled
                .iter()
                .filter(|matcher| !matcher.is_equality())
                .cloned()
                .collect();
            if !recheck.is_empty() {
                let selectivity: f64 = selector
                    .matchers
                    .iter()
                    .filter(|matcher| !matcher.is_equality())
                    .map(|matcher| matcher_selectivity(matcher.op))
                    .product();
                let estimate = scale_estimate(scan_estimate, selectivity);
                node = PlanNode::Filter(FilterNode {
                    matchers: recheck,
                    input: Box::new(node),
                    estimate,
                });
            }
            Ok(Lowered::Series {
                node,
                step: selector.native_step,
            })
        }
        ResolvedExpr::Aggregate(aggregate) => {
            let (input, step) = lower_series(&aggregate.input, window)?;
            let groups = group_estimate(&aggregate.grouping, input.estimate().series);
            let estimate = Estimate {
                series: groups,
                points: groups as u64 * points_at(window, step),
            };
            let node = PlanNode::Aggregate(AggregateNode {
                op: aggregate.op,
                grouping: aggregate.grouping.clone(),
                input: Box::new(input),
                estimate,
            });
            Ok(Lowered::Series { node, step })
        }
        ResolvedExpr::Rate(input) => {
            let (input, _) = lower_series(input, window)?;
            let series = input.estimate().series;
            let estimate = Estimate {
                series,
                points: series as u64 * points_at(window, window.step),
            };
            let node = PlanNode::Downsample(DownsampleNode {
                op: DownsampleOp::Rate,
                step: window.step,
                input: Box::new(input),
                estimate,
            });
            Ok(Lowered::Series {
                node,
                step: window.step,
            })
        }
        ResolvedExpr::Sort { descending, input } => {
            let (input, step) = lower_series(input, window)?;
            let estimate = input.estimate();
            let node = PlanNode::Sort(SortNode {
                descending: *descending,
                input: Box::new(input),
                estimate,
            });
            Ok(Lowered::Series { node, step })
        }
        ResolvedExpr::Rank {
            count,
            descending,
            input,
        } => {
            let (input, step) = lower_series(input, window)?;
            let sort_estimate = input.estimate();
            let sorted = PlanNode::Sort(SortNode {
                descending: *descending,
                input: Box::new(input),
                estimate: sort_estimate,
            });
            let series = sort_estimate.series.min(*count);
            let estimate = Estimate {
                series,
                points: series as u64 * points_at(window, step),
            };
            let node = PlanNode::Limit(LimitNode {
                count: *count,
                input: Box::new(sorted),
                estimate,
            });
            Ok(Lowered::Series { node, step })
        }
        ResolvedExpr::Binary(binary) => {
            let lhs = lower(&binary.lhs, window)?;
            let rhs = lower(&binary.rhs, window)?;
            match (lhs, rhs) {
                (Lowered::Scalar(lhs), Lowered::Scalar(rhs)) => {
                    Ok(Lowered::Scalar(binary.op.apply(lhs, rhs)))
                }
                (Lowered::Series { node, step }, Lowered::Scalar(value)) => Ok(combine(
                    binary.op,
                    CombineSide::Plan(Box::new(node)),
                    CombineSide::Scalar(value),
                    step,
                    window,
                )),
                (Lowered::Scalar(value), Lowered::Series { node, step }) => Ok(combine(
                    binary.op,
                    CombineSide::Scalar(value),
                    CombineSide::Plan(Box::new(node)),
                    step,
                    window,
                )),
                (
                    Lowered::Series {
                        node: lhs_node,
                        step: lhs_step,
                    },
                    Lowered::Series {
                        node: rhs_node,
                        step: rhs_step,
                    },
                ) => {
                    let step = lhs_step.max(rhs_step);
                    let lhs_node = align(lhs_node, lhs_step, step, window);
                    let rhs_node = align(rhs_node, rhs_step, step, window);
                    Ok(combine(
                        binary.op,
                        CombineSide::Plan(Box::new(lhs_node)),
                        CombineSide::Plan(Box::new(rhs_node)),
                        step,
                        window,
                    ))
                }
            }
        }
    }
}

fn lower_series(expr: &ResolvedExpr, window: &TimeWindow) -> Result<(PlanNode, i64), PlanError> {
    match lower(expr, window)? {
        Lowered::Series { node, step } => Ok((node, step)),
        Lowered::Scalar(value) => Err(PlanError::Unsupported(format!(
            "Cannot aggregate the constant {}",
            value
        ))),
    }
}

fn combine(op: BinOp, lhs: CombineSide, rhs: CombineSide, step: i64, window: &TimeWindow) -> Lowered {
    let series = match (&lhs, &rhs) {
        (CombineSide::Plan(lhs), CombineSide::Plan(rhs)) => {
            lhs.estimate().series.min(rhs.estimate().series)
        }
        (CombineSide::Plan(plan), CombineSide::Scalar(_))
        | (CombineSide::Scalar(_), CombineSide::Plan(plan)) => plan.estimate().series,
        (CombineSide::Scalar(_), CombineSide::Scalar(_)) => 0,
    };
    let estimate = Estimate {
        series,
        points: series as u64 * points_at(window, step),
    };
    Lowered::Series {
        node: PlanNode::Combine(CombineNode {
            op,
            lhs,
            rhs,
            step,
            estimate,
        }),
        step,
    }
}

/// Wraps `node` in an averaging downsample when its step differs from the
/// target step.
fn align(node: PlanNode, from: i64, to: i64, window: &TimeWindow) -> PlanNode {
    if from == to {
        return node;
    }
    let series = node.estimate().series;
    let estimate = Estimate {
        series,
        points: series as u64 * points_at(window, to),
    };
    PlanNode::Downsample(DownsampleNode {
        op: DownsampleOp::Avg,
        step: to,
        input: Box::new(node),
        estimate,
    })
}

fn points_at(window: &TimeWindow, step: i64) -> u64 {
    ((window.end - window.start) / step + 1) as u64
}

fn matcher_selectivity(op: MatchOp) -> f64 {
    match op {
        MatchOp::Eq => 0.1,
        MatchOp::Neq => 0.9,
        MatchOp::Re => 0.3,
        MatchOp::NotRe => 0.7,
    }
}

fn scale_estimate(estimate: Estimate, selectivity: f64) -> Estimate {
    Estimate {
        series: (estimate.series as f64 * selectivity) as usize,
        points: (estimate.points as f64 * selectivity) as u64,
    }
}

fn group_estimate(grouping: &Grouping, input_series: usize) -> usize {
    match grouping {
        Grouping::By(labels) if labels.is_empty() => 1,
        Grouping::Without(labels) if labels.is_empty() => input_series,
        _ => (input_series + 1) / 2,
    }
}

fn grouping_label(grouping: &Grouping) -> String {
    match grouping {
        Grouping::By(labels) => format!("by ({})", labels.join(", ")),
        Grouping::Without(labels) => format!("without ({})", labels.join(", ")),
    }
}
