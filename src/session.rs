//! # Tracking Session
//!
//! Per-subject state carried between successive live samples: the previous
//! sample and the attempts currently being tracked.
//!
//! A session is advanced strictly sequentially. It holds no lock of its own;
//! hosts that may receive concurrent samples for one subject go through a
//! [`SessionRegistry`](crate::SessionRegistry), which serialises them.
//!
//! ## Per-sample flow
//!
//! 1. Fetch candidate segments from the source.
//! 2. Keep those in the coarse region, then (with a previous sample) those
//!    near their start.
//! 3. Prefetch their reference traces in the background.
//! 4. Open attempts for segments whose start line was crossed within
//!    tolerance, awaiting their traces.
//! 5. Advance every in-progress attempt, refresh every ghost.
//! 6. Retire attempts that are no longer in progress, except finished ones
//!    still inside the grace window.
//! 7. Report attempts aligned past their second trace sample.
//!
//! Every fallible fetch happens before the first mutation, so a failed call
//! leaves the session exactly as it was.
//!
//! ## Time
//!
//! A sample's own timestamp is "now" for everything that sample drives:
//! crossings, the ghost, the finish grace window and `last_time`. The
//! injected [`Clock`] only stamps GPS samples that arrive without one.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::attempt::{Attempt, AttemptReport};
use crate::clock::{Clock, SystemClock};
use crate::crossing::detect_crossing;
use crate::error::{Result, TrackerError};
use crate::geo_utils::distance;
use crate::projection::{LngLatProjection, Projection};
use crate::source::SegmentSource;
use crate::{GpsPoint, ReferenceTrace, Segment, SegmentId, TimedPoint, TrackerConfig};

/// A raw GPS sample, before projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsSample {
    pub point: GpsPoint,
    /// Milliseconds since the Unix epoch. Stamped from the session clock
    /// when absent.
    #[serde(default)]
    pub time: Option<f64>,
}

/// Live tracking state for one subject.
pub struct TrackingSession {
    subject_id: String,
    source: Arc<dyn SegmentSource>,
    clock: Arc<dyn Clock>,
    projection: Arc<dyn Projection>,
    config: TrackerConfig,

    last_point: Option<TimedPoint>,
    last_time: Option<f64>,
    attempts: Vec<Attempt>,
}

impl TrackingSession {
    /// Start building a session with the system clock, lng/lat projection and
    /// default configuration.
    pub fn builder(subject_id: impl Into<String>, source: Arc<dyn SegmentSource>) -> TrackingSessionBuilder {
        TrackingSessionBuilder {
            subject_id: subject_id.into(),
            source,
            clock: Arc::new(SystemClock),
            projection: Arc::new(LngLatProjection),
            config: TrackerConfig::default(),
        }
    }

    /// Feed the next live sample and return the reportable attempts.
    ///
    /// `None` is a no-op and returns an empty list. On error the session is
    /// left untouched, so the next sample can simply be fed again.
    pub async fn advance(&mut self, point: Option<TimedPoint>) -> Result<Vec<AttemptReport>> {
        let Some(point) = point else {
            return Ok(Vec::new());
        };

        let segments = self.source.candidate_segments(&self.subject_id).await?;
        let here = point.point();

        let in_region: Vec<&Segment> = segments
            .iter()
            .filter(|s| distance(&here, &s.start) < self.config.region_threshold)
            .collect();
        let near_start: Vec<&Segment> = match self.last_point {
            Some(_) => in_region
                .iter()
                .copied()
                .filter(|s| distance(&here, &s.start) < self.config.near_start_threshold)
                .collect(),
            None => Vec::new(),
        };
        debug!(
            "[TrackingSession] {}: {} candidates, {} in region, {} near start",
            self.subject_id,
            segments.len(),
            in_region.len(),
            near_start.len()
        );

        if self.config.prefetch_traces {
            self.prefetch(&near_start);
        }

        let starting: Vec<(&Segment, TimedPoint)> = match self.last_point {
            Some(last) => near_start
                .iter()
                .filter(|s| !self.is_tracking(s.id))
                .filter_map(|s| {
                    let crossing = detect_crossing(&last, &point, &s.start)?;
                    (distance(&crossing.point(), &s.start) < self.config.start_tolerance)
                        .then_some((*s, crossing))
                })
                .collect(),
            None => Vec::new(),
        };

        let traces = try_join_all(starting.iter().map(|(s, _)| self.load_trace(s.id))).await?;

        // Nothing below can fail
        let now = point.time;
        for ((segment, crossing), trace) in starting.into_iter().zip(traces) {
            let mut attempt = Attempt::new(segment.clone(), trace);
            if attempt.initialize(crossing.time, self.config.min_trace_points) {
                info!(
                    "[TrackingSession] {}: started segment {} '{}'",
                    self.subject_id, segment.id, segment.name
                );
            } else {
                debug!(
                    "[TrackingSession] {}: crossed segment {} but no usable reference trace",
                    self.subject_id, segment.id
                );
            }
            self.attempts.push(attempt);
        }

        for attempt in &mut self.attempts {
            if let Some(last) = &self.last_point {
                attempt.advance(last, &point, &self.config);
            }
            attempt.update_ghost(now);
        }

        let grace = self.config.finish_grace_ms;
        self.attempts.retain(|a| !a.should_retire(now, grace));

        self.last_point = Some(point);
        self.last_time = Some(now);

        Ok(self.reports())
    }

    /// Project a raw GPS sample and advance with it.
    ///
    /// A sample without a timestamp is stamped with the session clock.
    pub async fn advance_gps(&mut self, sample: Option<GpsSample>) -> Result<Vec<AttemptReport>> {
        let Some(sample) = sample else {
            return Ok(Vec::new());
        };
        if !sample.point.is_valid() {
            return Err(TrackerError::InvalidCoordinates {
                message: format!(
                    "({}, {})",
                    sample.point.latitude, sample.point.longitude
                ),
            });
        }

        let time = sample.time.unwrap_or_else(|| self.clock.now_millis());
        let p = self.projection.project(&sample.point);
        self.advance(Some(TimedPoint::new(p.x, p.y, time))).await
    }

    /// Reports for the attempts that have aligned far enough to be meaningful.
    pub fn reports(&self) -> Vec<AttemptReport> {
        self.attempts
            .iter()
            .filter(|a| a.is_reportable())
            .map(Attempt::report)
            .collect()
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn last_point(&self) -> Option<TimedPoint> {
        self.last_point
    }

    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// Every retained attempt, reportable or not.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn is_tracking(&self, segment_id: SegmentId) -> bool {
        self.attempts.iter().any(|a| a.segment_id() == segment_id)
    }

    /// Warm the source's cache. Results are discarded; only useful when the
    /// source caches (see [`CachedSegmentSource`](crate::CachedSegmentSource)).
    fn prefetch(&self, segments: &[&Segment]) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        for segment in segments {
            let source = Arc::clone(&self.source);
            let subject = self.subject_id.clone();
            let filter = self.config.trace_filter.clone();
            let segment_id = segment.id;

            runtime.spawn(async move {
                if let Err(e) = source.reference_trace(segment_id, &subject, &filter).await {
                    warn!(
                        "[TrackingSession] Prefetch of segment {} failed: {}",
                        segment_id, e
                    );
                }
            });
        }
    }

    /// Fetch a reference trace, treating timeouts and cancellation as "none".
    async fn load_trace(&self, segment_id: SegmentId) -> Result<Option<Arc<ReferenceTrace>>> {
        let fetch = self
            .source
            .reference_trace(segment_id, &self.subject_id, &self.config.trace_filter);

        let result = match self.config.trace_fetch_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fetch)
                .await
                .unwrap_or_else(|_| {
                    Err(TrackerError::Cancelled {
                        message: format!("trace fetch timed out after {}ms", ms),
                    })
                }),
            None => fetch.await,
        };

        match result {
            Err(e) if e.is_cancellation() => {
                warn!(
                    "[TrackingSession] {}: no trace for segment {}: {}",
                    self.subject_id, segment_id, e
                );
                Ok(None)
            }
            other => other,
        }
    }
}

/// Builder for [`TrackingSession`].
pub struct TrackingSessionBuilder {
    subject_id: String,
    source: Arc<dyn SegmentSource>,
    clock: Arc<dyn Clock>,
    projection: Arc<dyn Projection>,
    config: TrackerConfig,
}

impl TrackingSessionBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn projection(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projection = projection;
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TrackingSession {
        TrackingSession {
            subject_id: self.subject_id,
            source: self.source,
            clock: self.clock,
            projection: self.projection,
            config: self.config,
            last_point: None,
            last_time: None,
            attempts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::{StaticSegmentSource, TraceFilter};
    use crate::{Point, TracePoint};
    use futures::future::{BoxFuture, FutureExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn sprint() -> Segment {
        Segment::new(1, "Sprint", Point::new(0.0, 0.0), Point::new(100.0, 0.0), 100.0)
    }

    fn sprint_trace() -> ReferenceTrace {
        ReferenceTrace::new(vec![
            TracePoint::new(0.0, 0.0, 0.0),
            TracePoint::new(50.0, 0.0, 10.0),
            TracePoint::new(100.0, 0.0, 20.0),
        ])
    }

    /// Static data whose fetches can be made to fail or hang.
    struct FlakySource {
        inner: StaticSegmentSource,
        fail_segments: AtomicBool,
        fail_traces: AtomicBool,
        hang_traces: AtomicBool,
        trace_calls: AtomicUsize,
    }

    impl FlakySource {
        fn new() -> Self {
            Self {
                inner: StaticSegmentSource::new(vec![sprint()], HashMap::from([(1, sprint_trace())])),
                fail_segments: AtomicBool::new(false),
                fail_traces: AtomicBool::new(false),
                hang_traces: AtomicBool::new(false),
                trace_calls: AtomicUsize::new(0),
            }
        }
    }

    impl SegmentSource for FlakySource {
        fn candidate_segments<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<Vec<Segment>>> {
            if self.fail_segments.load(Ordering::SeqCst) {
                return futures::future::ready(Err(TrackerError::source("segments unavailable"))).boxed();
            }
            self.inner.candidate_segments(subject_id)
        }

        fn reference_trace<'a>(
            &'a self,
            segment_id: SegmentId,
            subject_id: &'a str,
            filter: &'a TraceFilter,
        ) -> BoxFuture<'a, Result<Option<Arc<ReferenceTrace>>>> {
            self.trace_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_traces.load(Ordering::SeqCst) {
                return futures::future::pending().boxed();
            }
            if self.fail_traces.load(Ordering::SeqCst) {
                return futures::future::ready(Err(TrackerError::source("trace unavailable"))).boxed();
            }
            self.inner.reference_trace(segment_id, subject_id, filter)
        }
    }

    fn session(source: Arc<FlakySource>, clock: Arc<ManualClock>, config: TrackerConfig) -> TrackingSession {
        TrackingSession::builder("athlete", source)
            .clock(clock)
            .config(config)
            .build()
    }

    fn no_prefetch() -> TrackerConfig {
        TrackerConfig {
            prefetch_traces: false,
            ..TrackerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_none_is_noop() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut s = session(Arc::new(FlakySource::new()), clock.clone(), no_prefetch());

        assert!(s.advance(None).await.unwrap().is_empty());
        assert!(s.last_point().is_none());

        s.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await.unwrap();
        clock.set(1_000.0);
        s.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await.unwrap();
        let before_point = s.last_point();
        let before_attempts = s.attempts().len();

        assert!(s.advance(None).await.unwrap().is_empty());
        assert_eq!(s.last_point(), before_point);
        assert_eq!(s.attempts().len(), before_attempts);
        assert_eq!(s.last_time(), Some(1_000.0));
    }

    #[tokio::test]
    async fn test_first_point_never_opens_attempt() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut s = session(Arc::new(FlakySource::new()), clock, no_prefetch());

        // Right on the start line, but nothing to interpolate from
        s.advance(Some(TimedPoint::new(0.0, 0.0, 0.0))).await.unwrap();
        assert!(s.attempts().is_empty());
        assert_eq!(s.last_point(), Some(TimedPoint::new(0.0, 0.0, 0.0)));
    }

    #[tokio::test]
    async fn test_start_outside_tolerance_ignored() {
        let clock = Arc::new(ManualClock::new(0.0));
        let config = TrackerConfig {
            start_tolerance: 1.0,
            ..no_prefetch()
        };
        let mut s = session(Arc::new(FlakySource::new()), clock.clone(), config);

        // Passes 4 units beside the start
        s.advance(Some(TimedPoint::new(-5.0, 4.0, 0.0))).await.unwrap();
        clock.set(1_000.0);
        s.advance(Some(TimedPoint::new(5.0, 4.0, 1_000.0))).await.unwrap();
        assert!(s.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_segment_failure_leaves_state_untouched() {
        let source = Arc::new(FlakySource::new());
        let clock = Arc::new(ManualClock::new(0.0));
        let mut s = session(source.clone(), clock.clone(), no_prefetch());

        s.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await.unwrap();
        clock.set(1_000.0);
        s.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await.unwrap();
        assert_eq!(s.attempts().len(), 1);

        source.fail_segments.store(true, Ordering::SeqCst);
        clock.set(2_000.0);
        let err = s.advance(Some(TimedPoint::new(55.0, 0.0, 2_000.0))).await.unwrap_err();
        assert!(matches!(err, TrackerError::Source { .. }));
        assert_eq!(s.last_point(), Some(TimedPoint::new(5.0, 0.0, 1_000.0)));
        assert_eq!(s.last_time(), Some(1_000.0));
        assert_eq!(s.attempts()[0].last_index(), 0);

        // Retry with the same sample continues as if nothing happened
        source.fail_segments.store(false, Ordering::SeqCst);
        s.advance(Some(TimedPoint::new(55.0, 0.0, 2_000.0))).await.unwrap();
        assert_eq!(s.attempts()[0].last_index(), 1);
    }

    #[tokio::test]
    async fn test_trace_failure_propagates_without_mutation() {
        let source = Arc::new(FlakySource::new());
        source.fail_traces.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new(0.0));
        let mut s = session(source.clone(), clock.clone(), no_prefetch());

        s.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await.unwrap();
        clock.set(1_000.0);
        let result = s.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await;

        assert!(result.is_err());
        assert!(s.attempts().is_empty());
        assert_eq!(s.last_point(), Some(TimedPoint::new(-5.0, 0.0, 0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trace_timeout_means_no_trace() {
        let source = Arc::new(FlakySource::new());
        source.hang_traces.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::new(0.0));
        let config = TrackerConfig {
            trace_fetch_timeout_ms: Some(250),
            ..no_prefetch()
        };
        let mut s = session(source.clone(), clock.clone(), config);

        s.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await.unwrap();
        clock.set(1_000.0);
        let reports = s.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await.unwrap();

        // Matched without a trace: opened, never tracked, retired immediately
        assert!(reports.is_empty());
        assert!(s.attempts().is_empty());
        assert_eq!(s.last_point(), Some(TimedPoint::new(5.0, 0.0, 1_000.0)));
    }

    #[tokio::test]
    async fn test_prefetch_near_start() {
        let source = Arc::new(FlakySource::new());
        let clock = Arc::new(ManualClock::new(0.0));
        let mut s = session(source.clone(), clock.clone(), TrackerConfig::default());

        s.advance(Some(TimedPoint::new(-500.0, 0.0, 0.0))).await.unwrap();
        assert_eq!(source.trace_calls.load(Ordering::SeqCst), 0);

        // Near the start but not crossing it yet
        clock.set(1_000.0);
        s.advance(Some(TimedPoint::new(-300.0, 0.0, 1_000.0))).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(source.trace_calls.load(Ordering::SeqCst), 1);
        assert!(s.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_existing_attempt_not_replaced() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut s = session(Arc::new(FlakySource::new()), clock.clone(), no_prefetch());

        s.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await.unwrap();
        clock.set(1_000.0);
        s.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await.unwrap();
        let started = s.attempts()[0].start_time();

        // Wander back across the start line
        clock.set(2_000.0);
        s.advance(Some(TimedPoint::new(-5.0, 0.0, 2_000.0))).await.unwrap();
        clock.set(3_000.0);
        s.advance(Some(TimedPoint::new(5.0, 0.0, 3_000.0))).await.unwrap();

        assert_eq!(s.attempts().len(), 1);
        assert_eq!(s.attempts()[0].start_time(), started);
    }

    #[tokio::test]
    async fn test_advance_gps_projects_and_validates() {
        let clock = Arc::new(ManualClock::new(0.0));
        let projection = |p: &GpsPoint| Point::new(p.longitude * 10.0, p.latitude * 10.0);
        let mut s = TrackingSession::builder("athlete", Arc::new(FlakySource::new()))
            .clock(clock)
            .projection(Arc::new(projection))
            .config(no_prefetch())
            .build();

        let sample = GpsSample {
            point: GpsPoint::new(0.5, -0.5),
            time: Some(0.0),
        };
        s.advance_gps(Some(sample)).await.unwrap();
        assert_eq!(s.last_point(), Some(TimedPoint::new(-5.0, 5.0, 0.0)));

        let bad = GpsSample {
            point: GpsPoint::new(123.0, 0.0),
            time: Some(1_000.0),
        };
        let err = s.advance_gps(Some(bad)).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidCoordinates { .. }));
        assert_eq!(s.last_point(), Some(TimedPoint::new(-5.0, 5.0, 0.0)));
        assert!(s.advance_gps(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unstamped_gps_sample_uses_clock() {
        let clock = Arc::new(ManualClock::new(42_000.0));
        let mut s = session(Arc::new(FlakySource::new()), clock, no_prefetch());

        let sample = GpsSample {
            point: GpsPoint::new(0.0, -5.0),
            time: None,
        };
        s.advance_gps(Some(sample)).await.unwrap();
        assert_eq!(s.last_point(), Some(TimedPoint::new(-5.0, 0.0, 42_000.0)));
        assert_eq!(s.last_time(), Some(42_000.0));
    }

    #[tokio::test]
    async fn test_clock_skew_does_not_move_ghost() {
        // Host clock an hour ahead of the sample timestamps
        let clock = Arc::new(ManualClock::new(3_600_000.0));
        let mut s = session(Arc::new(FlakySource::new()), clock, no_prefetch());

        s.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await.unwrap();
        s.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await.unwrap();

        // Started at 500, 500 ms in: a quarter of the way to the first 10 s sample
        let pr = s.attempts()[0].pr().unwrap();
        assert_eq!(pr.position, Some(Point::new(2.5, 0.0)));
        assert_eq!(s.last_time(), Some(1_000.0));
    }
}
