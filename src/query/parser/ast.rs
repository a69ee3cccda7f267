use std::fmt;

use crate::storage::catalog::LabelMatcher;
use crate::storage::series::{Timestamp, NANOS_PER_SECOND};

/// A parsed query expression. The tree is purely syntactic: names are
/// unresolved and relative time bounds still reference `now`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Selector(MetricSelector),
    Call(FunctionCall),
    Binary(BinaryExpr),
    Range(RangeExpr),
    Literal(Literal),
}

impl Expr {
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(BinaryExpr {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn number(value: f64) -> Expr {
        Expr::Literal(Literal::Number(value))
    }
}

/// A metric name plus label predicates, e.g. `cpu_usage{host="a"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSelector {
    pub metric: String,
    pub matchers: Vec<LabelMatcher>,
}

impl MetricSelector {
    /// A selector with no label predicates.
    pub fn bare(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            matchers: Vec::new(),
        }
    }
}

/// A named function application, e.g. `sum(cpu_usage) by (region)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub grouping: Option<Grouping>,
}

/// Grouping clause attached to an aggregate call.
#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    /// Keep only the listed labels.
    By(Vec<String>),
    /// Keep everything except the listed labels.
    Without(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Gte => ">=",
            BinOp::Lte => "<=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    /// Applies the operator to two sample values. Comparisons and logical
    /// operators produce 1.0 for true and 0.0 for false, treating any
    /// non-zero operand as true. Division and modulo follow IEEE 754.
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinOp::Add => lhs + rhs,
            BinOp::Sub => lhs - rhs,
            BinOp::Mul => lhs * rhs,
            BinOp::Div => lhs / rhs,
            BinOp::Mod => lhs % rhs,
            BinOp::Eq => flag(lhs == rhs),
            BinOp::Neq => flag(lhs != rhs),
            BinOp::Gt => flag(lhs > rhs),
            BinOp::Lt => flag(lhs < rhs),
            BinOp::Gte => flag(lhs >= rhs),
            BinOp::Lte => flag(lhs <= rhs),
            BinOp::And => flag(lhs != 0.0 && rhs != 0.0),
            BinOp::Or => flag(lhs != 0.0 || rhs != 0.0),
        }
    }
}

fn flag(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

/// An expression with an explicit evaluation window, e.g.
/// `cpu_usage[now-1h:now:30s]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeExpr {
    pub expr: Box<Expr>,
    pub range: TimeRangeSpec,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRangeSpec {
    pub start: TimeBound,
    pub end: TimeBound,
    // Step in nanoseconds; the resolver picks one when absent.
    pub step: Option<i64>,
}

/// One endpoint of an evaluation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeBound {
    Now,
    // Nanoseconds before the evaluation time.
    Offset(i64),
    // Absolute nanoseconds since the epoch.
    At(Timestamp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
}

/// Renders a nanosecond duration in the largest unit that divides it
/// exactly, so `90_000_000_000` prints as `90s` rather than `1.5m`.
pub fn format_duration(nanos: i64) -> String {
    const UNITS: &[(i64, &str)] = &[
        (7 * 24 * 3600 * NANOS_PER_SECOND, "w"),
        (24 * 3600 * NANOS_PER_SECOND, "d"),
        (3600 * NANOS_PER_SECOND, "h"),
        (60 * NANOS_PER_SECOND, "m"),
        (NANOS_PER_SECOND, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
        (1, "ns"),
    ];
    for &(per_unit, suffix) in UNITS {
        if nanos != 0 && nanos % per_unit == 0 {
            return format!("{}{}", nanos / per_unit, suffix);
        }
    }
    "0s".to_string()
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Selector(selector) => write!(f, "{}", selector),
            Expr::Call(call) => write!(f, "{}", call),
            Expr::Binary(binary) => write!(f, "{}", binary),
            Expr::Range(range) => write!(f, "{}", range),
            Expr::Literal(literal) => write!(f, "{}", literal),
        }
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metric)?;
        if !self.matchers.is_empty() {
            write!(f, "{{")?;
            for (i, matcher) in self.matchers.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", matcher)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")?;
        match &self.grouping {
            Some(Grouping::By(labels)) => write!(f, " by ({})", labels.join(", ")),
            Some(Grouping::Without(labels)) => write!(f, " without ({})", labels.join(", ")),
            None => Ok(()),
        }
    }
}

impl fmt::Display for BinaryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Always parenthesized, so the rendering is unambiguous without
        // knowledge of precedence.
        write!(f, "({} {} {})", self.lhs, self.op.symbol(), self.rhs)
    }
}

impl fmt::Display for RangeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}", self.expr, self.range.start, self.range.end)?;
        if let Some(step) = self.range.step {
            write!(f, ":{}", format_duration(step))?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBound::Now => write!(f, "now"),
            TimeBound::Offset(nanos) => write!(f, "now-{}", format_duration(*nanos)),
            TimeBound::At(timestamp) => write!(f, "{}", timestamp),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(value) => write!(f, "{}", value),
            Literal::Str(value) => write!(f, "\"{}\"", value),
        }
    }
}
