use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::query::parser::ast::{BinOp, Grouping};
use crate::query::planner::{CombineNode, CombineSide, DownsampleOp, PhysicalPlan, PlanNode};
use crate::query::resolver::{AggregateOp, TimeWindow};
use crate::storage::catalog::{CompiledMatcher, SeriesEntry};
use crate::storage::reader::{ReadError, StorageReader};
use crate::storage::series::{
    Labels, Sample, SeriesFrame, SeriesId, Timestamp, NANOS_PER_SECOND,
};

/// Error type for execution operations
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage read failed for series {series}: {source}")]
    Storage {
        series: SeriesId,
        #[source]
        source: ReadError,
    },
    #[error("Query cancelled")]
    Cancelled,
}

/// Result type for execution operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Configuration for query execution
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Estimated point count above which the two sides of a combine are
    /// drained by parallel workers
    pub parallel_threshold: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 100_000, // points across both combine sides
        }
    }
}

/// Cooperative cancellation flag shared between a running query and its
/// owner. Every operator checks it once per production step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Demand-pull producer of series frames. `Ok(None)` means exhausted.
trait SeriesStream: Send {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>>;

    /// Releases buffered frames and upstream inputs. Must be idempotent.
    fn close(&mut self);
}

/// The lazy result of one query execution: a single-pass sequence of
/// series frames pulled on demand from the operator tree.
pub struct ResultStream {
    root: Box<dyn SeriesStream>,
    token: CancelToken,
    state: StreamState,
}

enum StreamState {
    Idle,
    Running,
    Done,
}

impl ResultStream {
    /// Pulls the next output series. Cancelling before the first pull ends
    /// the stream cleanly; cancelling once running surfaces `Cancelled`.
    pub fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        match self.state {
            StreamState::Done => Ok(None),
            StreamState::Idle if self.token.is_cancelled() => {
                self.state = StreamState::Done;
                self.root.close();
                Ok(None)
            }
            _ => {
                self.state = StreamState::Running;
                match self.root.next_series() {
                    Ok(Some(frame)) => Ok(Some(frame)),
                    Ok(None) => {
                        self.state = StreamState::Done;
                        self.root.close();
                        Ok(None)
                    }
                    Err(err) => {
                        self.state = StreamState::Done;
                        self.root.close();
                        Err(err)
                    }
                }
            }
        }
    }

    /// Drives the stream to completion, collecting every frame.
    pub fn collect_frames(mut self) -> ExecutionResult<Vec<SeriesFrame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_series()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Iterator for ResultStream {
    type Item = ExecutionResult<SeriesFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_series().transpose()
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.root.close();
    }
}

/// Builds the operator tree for a plan and returns its lazy result stream.
pub fn execute(
    plan: &PhysicalPlan,
    reader: Arc<dyn StorageReader>,
    token: CancelToken,
    config: &ExecutionConfig,
) -> ResultStream {
    let root = build(&plan.root, &plan.window, &reader, &token, config);
    ResultStream {
        root,
        token,
        state: StreamState::Idle,
    }
}

fn build(
    node: &PlanNode,
    window: &TimeWindow,
    reader: &Arc<dyn StorageReader>,
    token: &CancelToken,
    config: &ExecutionConfig,
) -> Box<dyn SeriesStream> {
    match node {
        PlanNode::Scan(scan) => Box::new(ScanStream {
            entries: scan.series.clone().into_iter(),
            reader: Arc::clone(reader),
            start: window.start,
            end: window.end,
            token: token.clone(),
        }),
        PlanNode::Filter(filter) => Box::new(FilterStream {
            matchers: filter.matchers.clone(),
            input: build(&filter.input, window, reader, token, config),
            token: token.clone(),
        }),
        PlanNode::Aggregate(aggregate) => Box::new(AggregateStream {
            op: aggregate.op,
            grouping: aggregate.grouping.clone(),
            input: Some(build(&aggregate.input, window, reader, token, config)),
            output: None,
            token: token.clone(),
        }),
        PlanNode::Combine(combine) => build_combine(combine, window, reader, token, config),
        PlanNode::Downsample(down) => Box::new(DownsampleStream {
            op: down.op,
            step: down.step,
            start: window.start,
            input: build(&down.input, window, reader, token, config),
            token: token.clone(),
        }),
        PlanNode::Sort(sort) => Box::new(SortStream {
            descending: sort.descending,
            input: Some(build(&sort.input, window, reader, token, config)),
            output: None,
            token: token.clone(),
        }),
        PlanNode::Limit(limit) => Box::new(LimitStream {
            remaining: limit.count,
            input: build(&limit.input, window, reader, token, config),
            closed: false,
            token: token.clone(),
        }),
    }
}

fn build_combine(
    node: &CombineNode,
    window: &TimeWindow,
    reader: &Arc<dyn StorageReader>,
    token: &CancelToken,
    config: &ExecutionConfig,
) -> Box<dyn SeriesStream> {
    match (&node.lhs, &node.rhs) {
        (CombineSide::Plan(lhs), CombineSide::Plan(rhs)) => {
            let left_points = lhs.estimate().points;
            let right_points = rhs.estimate().points;
            Box::new(JoinCombineStream {
                op: node.op,
                step: node.step,
                parallel: left_points + right_points > config.parallel_threshold,
                // Index the smaller estimated side, stream the larger.
                index_left: left_points < right_points,
                left: Some(build(lhs, window, reader, token, config)),
                right: Some(build(rhs, window, reader, token, config)),
                partners: HashMap::new(),
                buffered: None,
                matched: 0,
                started: false,
                done: false,
                token: token.clone(),
            })
        }
        (CombineSide::Plan(plan), CombineSide::Scalar(value)) => Box::new(ScalarCombineStream {
            op: node.op,
            scalar: *value,
            scalar_on_left: false,
            input: build(plan, window, reader, token, config),
            token: token.clone(),
        }),
        (CombineSide::Scalar(value), CombineSide::Plan(plan)) => Box::new(ScalarCombineStream {
            op: node.op,
            scalar: *value,
            scalar_on_left: true,
            input: build(plan, window, reader, token, config),
            token: token.clone(),
        }),
        // Scalar pairs fold during planning.
        (CombineSide::Scalar(_), CombineSide::Scalar(_)) => Box::new(EmptyStream),
    }
}

fn drain(stream: &mut dyn SeriesStream) -> ExecutionResult<Vec<SeriesFrame>> {
    let mut frames = Vec::new();
    while let Some(frame) = stream.next_series()? {
        frames.push(frame);
    }
    Ok(frames)
}

/// Pulls one series per pull directly from the storage reader. A series the
/// reader no longer knows degrades to an empty frame instead of an error.
struct ScanStream {
    entries: std::vec::IntoIter<SeriesEntry>,
    reader: Arc<dyn StorageReader>,
    start: Timestamp,
    end: Timestamp,
    token: CancelToken,
}

impl SeriesStream for ScanStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let entry = match self.entries.next() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let iter = match self.reader.open(entry.id, self.start, self.end) {
            Ok(iter) => iter,
            Err(ReadError::UnknownSeries(_)) => {
                warn!("Series vanished between resolve and scan: id={}", entry.id);
                return Ok(Some(SeriesFrame::new(Some(entry.id), entry.labels)));
            }
            Err(source) => {
                return Err(ExecutionError::Storage {
                    series: entry.id,
                    source,
                })
            }
        };

        let mut samples = Vec::new();
        for item in iter {
            match item {
                Ok(sample) => samples.push(sample),
                Err(ReadError::UnknownSeries(_)) => {
                    warn!("Series vanished mid-read: id={}", entry.id);
                    samples.clear();
                    break;
                }
                Err(source) => {
                    return Err(ExecutionError::Storage {
                        series: entry.id,
                        source,
                    })
                }
            }
        }
        debug!("Scanned series: id={} samples={}", entry.id, samples.len());
        Ok(Some(SeriesFrame::with_samples(
            Some(entry.id),
            entry.labels,
            samples,
        )))
    }

    fn close(&mut self) {
        self.entries = Vec::new().into_iter();
    }
}

/// Re-checks non-equality matchers against the labels each frame carries.
struct FilterStream {
    matchers: Vec<CompiledMatcher>,
    input: Box<dyn SeriesStream>,
    token: CancelToken,
}

impl SeriesStream for FilterStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        loop {
            let frame = match self.input.next_series()? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            if self.matchers.iter().all(|m| m.matches(&frame.labels)) {
                return Ok(Some(frame));
            }
            debug!("Filtered out series: labels={}", frame.labels);
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Groups input series by projected labels and folds samples per timestamp,
/// so memory holds the aggregated output rather than the raw inputs.
struct AggregateStream {
    op: AggregateOp,
    grouping: Grouping,
    input: Option<Box<dyn SeriesStream>>,
    output: Option<std::vec::IntoIter<SeriesFrame>>,
    token: CancelToken,
}

impl AggregateStream {
    fn group_labels(&self, labels: &Labels) -> Labels {
        match &self.grouping {
            Grouping::By(names) => labels.project(names),
            Grouping::Without(names) => labels.without(names),
        }
    }

    fn fold_input(
        &self,
        input: &mut Box<dyn SeriesStream>,
    ) -> ExecutionResult<Vec<SeriesFrame>> {
        let mut groups: BTreeMap<Labels, BTreeMap<Timestamp, Acc>> = BTreeMap::new();
        while let Some(frame) = input.next_series()? {
            let key = self.group_labels(&frame.labels);
            let buckets = groups.entry(key).or_default();
            for sample in &frame.samples {
                buckets
                    .entry(sample.timestamp)
                    .and_modify(|acc| acc.fold(sample.value))
                    .or_insert_with(|| Acc::new(sample.value));
            }
        }

        let op = self.op;
        Ok(groups
            .into_iter()
            .map(|(labels, buckets)| {
                let samples = buckets
                    .into_iter()
                    .map(|(timestamp, acc)| Sample::new(timestamp, acc.finish(op)))
                    .collect();
                SeriesFrame::with_samples(None, labels, samples)
            })
            .collect())
    }
}

impl SeriesStream for AggregateStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if self.output.is_none() {
            let mut input = match self.input.take() {
                Some(input) => input,
                None => return Ok(None),
            };
            let folded = self.fold_input(&mut input);
            input.close();
            self.output = Some(folded?.into_iter());
        }
        Ok(self.output.as_mut().and_then(|frames| frames.next()))
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.output = None;
    }
}

/// Per-timestamp accumulator covering all aggregation ops.
struct Acc {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl Acc {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    fn fold(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    fn finish(&self, op: AggregateOp) -> f64 {
        match op {
            AggregateOp::Sum => self.sum,
            AggregateOp::Avg => self.sum / self.count as f64,
            AggregateOp::Min => self.min,
            AggregateOp::Max => self.max,
            AggregateOp::Count => self.count as f64,
        }
    }
}

/// Joins two series-valued sides by identical label sets. The side with the
/// smaller estimated footprint is drained into a partner index up front; the
/// index is the join width that bounds memory, and the other side streams
/// through, one merged frame per matched pair. Above the parallel threshold
/// both sides are drained together on worker threads before merging.
struct JoinCombineStream {
    op: BinOp,
    step: i64,
    parallel: bool,
    /// True when the left input feeds the partner index.
    index_left: bool,
    left: Option<Box<dyn SeriesStream>>,
    right: Option<Box<dyn SeriesStream>>,
    partners: HashMap<Labels, SeriesFrame>,
    buffered: Option<std::vec::IntoIter<SeriesFrame>>,
    matched: usize,
    started: bool,
    done: bool,
    token: CancelToken,
}

impl JoinCombineStream {
    fn start(&mut self) -> ExecutionResult<()> {
        self.started = true;
        let indexed = if self.index_left {
            self.left.take()
        } else {
            self.right.take()
        };
        let mut indexed = match indexed {
            Some(indexed) => indexed,
            None => return Ok(()),
        };

        let indexed_frames = if self.parallel {
            let outer = if self.index_left {
                self.right.take()
            } else {
                self.left.take()
            };
            let mut outer = match outer {
                Some(outer) => outer,
                None => return Ok(()),
            };
            let (outer_frames, indexed_frames) =
                rayon::join(|| drain(outer.as_mut()), || drain(indexed.as_mut()));
            outer.close();
            indexed.close();
            self.buffered = Some(outer_frames?.into_iter());
            indexed_frames?
        } else {
            let frames = drain(indexed.as_mut());
            indexed.close();
            frames?
        };

        self.partners = indexed_frames
            .into_iter()
            .map(|frame| (frame.labels.clone(), frame))
            .collect();
        Ok(())
    }

    fn next_outer(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if let Some(frames) = &mut self.buffered {
            return Ok(frames.next());
        }
        let outer = if self.index_left {
            &mut self.right
        } else {
            &mut self.left
        };
        match outer {
            Some(outer) => outer.next_series(),
            None => Ok(None),
        }
    }
}

impl SeriesStream for JoinCombineStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if self.done {
            return Ok(None);
        }
        if !self.started {
            self.start()?;
        }
        loop {
            let frame = match self.next_outer()? {
                Some(frame) => frame,
                None => {
                    if self.matched < self.partners.len() {
                        warn!(
                            "Combine dropped {} series with no partner on the other side",
                            self.partners.len() - self.matched
                        );
                    }
                    self.done = true;
                    self.partners.clear();
                    return Ok(None);
                }
            };
            if let Some(partner) = self.partners.get(&frame.labels) {
                self.matched += 1;
                // The merge anchors on the left operand regardless of
                // which side was indexed.
                let merged = if self.index_left {
                    merge_pair(self.op, self.step, partner, &frame)
                } else {
                    merge_pair(self.op, self.step, &frame, partner)
                };
                return Ok(Some(merged));
            }
            warn!("Combine dropped unmatched series: labels={}", frame.labels);
        }
    }

    fn close(&mut self) {
        if let Some(mut left) = self.left.take() {
            left.close();
        }
        if let Some(mut right) = self.right.take() {
            right.close();
        }
        self.partners.clear();
        self.buffered = None;
        self.done = true;
    }
}

/// Applies a binary operator between a series side and a folded constant.
struct ScalarCombineStream {
    op: BinOp,
    scalar: f64,
    scalar_on_left: bool,
    input: Box<dyn SeriesStream>,
    token: CancelToken,
}

impl SeriesStream for ScalarCombineStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let frame = match self.input.next_series()? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let samples = frame
            .samples
            .iter()
            .map(|sample| {
                let value = if self.scalar_on_left {
                    self.op.apply(self.scalar, sample.value)
                } else {
                    self.op.apply(sample.value, self.scalar)
                };
                Sample::new(sample.timestamp, value)
            })
            .collect();
        Ok(Some(SeriesFrame::with_samples(
            frame.id,
            frame.labels,
            samples,
        )))
    }

    fn close(&mut self) {
        self.input.close();
    }
}

struct EmptyStream;

impl SeriesStream for EmptyStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        Ok(None)
    }

    fn close(&mut self) {}
}

/// Re-buckets each frame onto the `start + k * step` grid, one output
/// sample per non-empty bucket.
struct DownsampleStream {
    op: DownsampleOp,
    step: i64,
    start: Timestamp,
    input: Box<dyn SeriesStream>,
    token: CancelToken,
}

impl SeriesStream for DownsampleStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        match self.input.next_series()? {
            Some(frame) => Ok(Some(downsample_frame(self.op, self.step, self.start, frame))),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

struct Bucket {
    sum: f64,
    count: u64,
    first: Sample,
    last: Sample,
}

impl Bucket {
    fn new(sample: Sample) -> Self {
        Self {
            sum: sample.value,
            count: 1,
            first: sample,
            last: sample,
        }
    }

    fn fold(&mut self, sample: Sample) {
        self.sum += sample.value;
        self.count += 1;
        self.last = sample;
    }

    fn finish(&self, op: DownsampleOp) -> Option<f64> {
        match op {
            DownsampleOp::Avg => Some(self.sum / self.count as f64),
            DownsampleOp::Rate => {
                let elapsed =
                    (self.last.timestamp - self.first.timestamp) as f64 / NANOS_PER_SECOND as f64;
                if elapsed > 0.0 {
                    Some((self.last.value - self.first.value) / elapsed)
                } else {
                    // A single sample gives no rate.
                    None
                }
            }
        }
    }
}

/// Buckets cover `(grid - step, grid]`; a sample exactly on the window
/// start lands on the first grid point.
fn downsample_frame(op: DownsampleOp, step: i64, start: Timestamp, frame: SeriesFrame) -> SeriesFrame {
    let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();
    for sample in &frame.samples {
        let offset = sample.timestamp - start;
        let index = if offset <= 0 { 0 } else { (offset + step - 1) / step };
        buckets
            .entry(index)
            .and_modify(|bucket| bucket.fold(*sample))
            .or_insert_with(|| Bucket::new(*sample));
    }

    let samples = buckets
        .into_iter()
        .filter_map(|(index, bucket)| {
            bucket
                .finish(op)
                .map(|value| Sample::new(start + index * step, value))
        })
        .collect();
    SeriesFrame::with_samples(frame.id, frame.labels, samples)
}

/// Orders fully drained input by each series' final sample value; series
/// with no samples sort first ascending. Ties break on the label set.
struct SortStream {
    descending: bool,
    input: Option<Box<dyn SeriesStream>>,
    output: Option<std::vec::IntoIter<SeriesFrame>>,
    token: CancelToken,
}

impl SeriesStream for SortStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if self.output.is_none() {
            let mut input = match self.input.take() {
                Some(input) => input,
                None => return Ok(None),
            };
            let frames = drain(input.as_mut());
            input.close();
            let mut frames = frames?;
            let descending = self.descending;
            frames.sort_by(|a, b| compare_frames(a, b, descending));
            self.output = Some(frames.into_iter());
        }
        Ok(self.output.as_mut().and_then(|frames| frames.next()))
    }

    fn close(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.output = None;
    }
}

fn compare_frames(a: &SeriesFrame, b: &SeriesFrame, descending: bool) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let by_value = match (a.last_value(), b.last_value()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.total_cmp(&y),
    };
    let by_value = if descending { by_value.reverse() } else { by_value };
    by_value.then_with(|| a.labels.cmp(&b.labels))
}

/// Passes through the first `count` frames, then closes its input.
struct LimitStream {
    remaining: usize,
    input: Box<dyn SeriesStream>,
    closed: bool,
    token: CancelToken,
}

impl SeriesStream for LimitStream {
    fn next_series(&mut self) -> ExecutionResult<Option<SeriesFrame>> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if self.remaining == 0 {
            if !self.closed {
                self.input.close();
                self.closed = true;
            }
            return Ok(None);
        }
        match self.input.next_series()? {
            Some(frame) => {
                self.remaining -= 1;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.input.close();
        self.closed = true;
    }
}

/// Left-anchored pairing: each left sample partners with the nearest right
/// sample at or before it and within one step; unmatched points drop.
fn merge_pair(op: BinOp, step: i64, left: &SeriesFrame, right: &SeriesFrame) -> SeriesFrame {
    let mut samples = Vec::with_capacity(left.samples.len());
    let mut cursor = 0usize;
    for sample in &left.samples {
        while cursor < right.samples.len() && right.samples[cursor].timestamp <= sample.timestamp {
            cursor += 1;
        }
        if cursor == 0 {
            continue;
        }
        let partner = right.samples[cursor - 1];
        if sample.timestamp - partner.timestamp <= step {
            samples.push(Sample::new(
                sample.timestamp,
                op.apply(sample.value, partner.value),
            ));
        }
    }
    SeriesFrame::with_samples(None, left.labels.clone(), samples)
}
