//! # Segment Progress Tracking
//!
//! An [`Attempt`] is one live traversal of one segment. It is opened when a
//! start-line crossing is detected and then advanced once per live sample:
//!
//! ```text
//! Matched ──initialize──> InProgress ──finish crossing──> Finished
//!                              │
//!                              └──lost track──> Abandoned
//! ```
//!
//! `Matched` is terminal for attempts without a usable reference trace; they
//! are never reported. There is no way back from `Finished` or `Abandoned`.
//!
//! ## Alignment
//!
//! Each sample is aligned to the reference trace with a bounded forward
//! hill-climb from just past the last aligned index, followed by a one-step
//! backoff when the subject has not yet reached the chosen sample. The trace
//! is assumed to be traversed monotonically, so routes that double back on
//! themselves can misalign.

use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::clock::format_timestamp;
use crate::crossing::detect_crossing;
use crate::geo_utils::distance;
use crate::{Point, ReferenceTrace, Segment, SegmentId, TimedPoint, TracePoint, TrackerConfig};

/// Lifecycle state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Start crossing seen but no usable reference trace
    Matched,
    InProgress,
    Finished,
    /// Track lost mid-segment
    Abandoned,
}

/// Where the reference effort would be at the current elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrPosition {
    /// Total time of the reference effort in seconds
    pub time: f64,
    /// Ghost position; absent once the reference effort has finished
    #[serde(flatten)]
    pub position: Option<Point>,
}

/// Serialisable view of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptReport {
    pub id: SegmentId,
    pub name: String,
    pub start: Point,
    pub end: Point,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub finished: bool,
    /// Seconds behind (+) or ahead (-) of the reference effort
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrPosition>,
}

/// One subject's progress on one segment.
#[derive(Debug, Clone)]
pub struct Attempt {
    segment: Segment,
    trace: Option<Arc<ReferenceTrace>>,
    state: AttemptState,
    start_time: Option<f64>,
    last_index: usize,
    last_index_time: Option<f64>,
    finish_time: Option<f64>,
    difference: Option<f64>,
    pr: Option<PrPosition>,
}

impl Attempt {
    /// A matched attempt that has not started tracking.
    pub fn new(segment: Segment, trace: Option<Arc<ReferenceTrace>>) -> Self {
        Self {
            segment,
            trace,
            state: AttemptState::Matched,
            start_time: None,
            last_index: 0,
            last_index_time: None,
            finish_time: None,
            difference: None,
            pr: None,
        }
    }

    /// Start tracking from the interpolated start-line crossing.
    ///
    /// Returns `false` and stays `Matched` when the trace is missing or has
    /// fewer than `min_trace_points` samples.
    pub fn initialize(&mut self, crossing_time: f64, min_trace_points: usize) -> bool {
        if self.state != AttemptState::Matched {
            return false;
        }
        let usable = self
            .trace
            .as_ref()
            .is_some_and(|t| t.is_usable(min_trace_points));
        if !usable {
            return false;
        }

        self.state = AttemptState::InProgress;
        self.start_time = Some(crossing_time);
        self.last_index = 0;
        self.last_index_time = Some(crossing_time);
        true
    }

    /// Advance with the newest live sample. `last` is the sample before it.
    ///
    /// No-op unless the attempt is in progress.
    pub fn advance(&mut self, last: &TimedPoint, point: &TimedPoint, config: &TrackerConfig) {
        if self.state != AttemptState::InProgress {
            return;
        }
        let Some(trace) = self.trace.clone() else {
            return;
        };
        let points = trace.points();
        let n = points.len();
        if n < 2 {
            return;
        }

        let here = point.point();
        let candidate = (self.last_index + 1).min(n - 1);
        let mut index = align_forward(points, &here, candidate, config.alignment_lookahead);

        // Not past the chosen sample yet: still between it and the previous one
        if index > self.last_index {
            let previous = points[index - 1].point();
            if distance(&here, &previous) < distance(&previous, &points[index].point()) {
                index -= 1;
            }
        }

        if index + 2 >= n {
            if let Some(crossing) = detect_crossing(last, point, &self.segment.end) {
                self.state = AttemptState::Finished;
                self.finish_time = Some(crossing.time);
                info!(
                    "[Attempt] Segment {} '{}' finished in {:.1}s",
                    self.segment.id,
                    self.segment.name,
                    self.elapsed_seconds(crossing.time).unwrap_or_default()
                );
                return;
            }
        }

        let target = points[index];
        match detect_crossing(last, point, &target.point()) {
            Some(crossing) => {
                self.last_index = index;
                self.last_index_time = Some(crossing.time);
                self.difference = self
                    .elapsed_seconds(crossing.time)
                    .map(|elapsed| elapsed - target.elapsed_seconds);
                debug!(
                    "[Attempt] Segment {} aligned to trace index {}/{} ({:+.1}s)",
                    self.segment.id,
                    index,
                    n - 1,
                    self.difference.unwrap_or_default()
                );
            }
            None => {
                let off_by = distance(&here, &target.point());
                if off_by > config.abandon_threshold {
                    self.state = AttemptState::Abandoned;
                    info!(
                        "[Attempt] Segment {} abandoned: {:.0} from trace index {}",
                        self.segment.id, off_by, index
                    );
                }
            }
        }
    }

    /// Recompute the ghost position for wall-clock time `now`.
    pub fn update_ghost(&mut self, now: f64) {
        let (Some(trace), Some(start)) = (&self.trace, self.start_time) else {
            return;
        };
        let Some(total) = trace.total_seconds() else {
            return;
        };
        if trace.len() < 2 {
            return;
        }

        self.pr = Some(PrPosition {
            time: total,
            position: trace.position_at(now - start),
        });
    }

    /// Whether the attempt should be dropped from the session at time `now`.
    pub fn should_retire(&self, now: f64, grace_ms: f64) -> bool {
        match self.state {
            AttemptState::InProgress => false,
            AttemptState::Finished => self.finish_time.map_or(true, |t| now - t >= grace_ms),
            AttemptState::Matched | AttemptState::Abandoned => true,
        }
    }

    /// Whether the attempt has aligned far enough into the trace to report.
    pub fn is_reportable(&self) -> bool {
        self.last_index > 1
    }

    pub fn report(&self) -> AttemptReport {
        AttemptReport {
            id: self.segment.id,
            name: self.segment.name.clone(),
            start: self.segment.start,
            end: self.segment.end,
            start_time: self.start_time.and_then(format_timestamp),
            end_time: self.finish_time.and_then(format_timestamp),
            finished: self.is_finished(),
            difference: self.difference,
            pr: self.pr,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment.id
    }

    pub fn trace(&self) -> Option<&ReferenceTrace> {
        self.trace.as_deref()
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == AttemptState::InProgress
    }

    pub fn is_finished(&self) -> bool {
        self.state == AttemptState::Finished
    }

    pub fn start_time(&self) -> Option<f64> {
        self.start_time
    }

    pub fn last_index(&self) -> usize {
        self.last_index
    }

    pub fn last_index_time(&self) -> Option<f64> {
        self.last_index_time
    }

    pub fn finish_time(&self) -> Option<f64> {
        self.finish_time
    }

    pub fn difference(&self) -> Option<f64> {
        self.difference
    }

    pub fn pr(&self) -> Option<PrPosition> {
        self.pr
    }

    fn elapsed_seconds(&self, time: f64) -> Option<f64> {
        self.start_time.map(|start| (time - start) / 1000.0)
    }
}

/// Bounded forward hill-climb: repeatedly jump to the nearest of the next
/// `lookahead` samples while that moves the index forward.
fn align_forward(points: &[TracePoint], here: &Point, from: usize, lookahead: usize) -> usize {
    let mut index = from;
    loop {
        let next = nearest_ahead(points, here, index, lookahead);
        if next <= index {
            return index;
        }
        index = next;
    }
}

fn nearest_ahead(points: &[TracePoint], here: &Point, from: usize, lookahead: usize) -> usize {
    let end = (from + lookahead).min(points.len());
    let mut best = from;
    let mut best_dist = distance(here, &points[from].point());

    for (i, p) in points.iter().enumerate().take(end).skip(from + 1) {
        let d = distance(here, &p.point());
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}
