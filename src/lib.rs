//! # Segment Tracker
//!
//! Live segment matching for a single moving subject.
//!
//! This library provides:
//! - Start and finish line crossing detection between coarse GPS samples
//! - Progress tracking along a previously recorded reference effort
//! - Live time delta and "ghost" position against that effort
//! - A get-or-create cache with sliding expiration and de-duplicated creation
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use segment_tracker::{
//!     ManualClock, ReferenceTrace, Segment, StaticSegmentSource, TimedPoint, TracePoint,
//!     TrackerConfig, TrackingSession, Point,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> segment_tracker::Result<()> {
//! let segment = Segment::new(1, "Sprint", Point::new(0.0, 0.0), Point::new(100.0, 0.0), 100.0);
//! let trace = ReferenceTrace::new(vec![
//!     TracePoint::new(0.0, 0.0, 0.0),
//!     TracePoint::new(50.0, 0.0, 10.0),
//!     TracePoint::new(100.0, 0.0, 20.0),
//! ]);
//! let source = StaticSegmentSource::new(vec![segment], HashMap::from([(1, trace)]));
//! let clock = Arc::new(ManualClock::new(0.0));
//!
//! let mut session = TrackingSession::builder("athlete-1", Arc::new(source))
//!     .clock(clock.clone())
//!     .config(TrackerConfig::default())
//!     .build();
//!
//! session.advance(Some(TimedPoint::new(-5.0, 0.0, 0.0))).await?;
//! clock.set(1_000.0);
//! session.advance(Some(TimedPoint::new(5.0, 0.0, 1_000.0))).await?;
//! assert!(session.attempts()[0].is_in_progress());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, TrackerError};

// Planar distance and interpolation
pub mod geo_utils;

// Lat/lng -> planar projection capability
pub mod projection;
pub use projection::{LngLatProjection, Projection};

// Injected time source
pub mod clock;
pub use clock::{format_timestamp, Clock, ManualClock, SystemClock};

// Get-or-create cache with TTL and creation de-duplication
pub mod cache;
pub use cache::{Cache, CacheOptions};

// Interpolated crossing detection between two samples
pub mod crossing;
pub use crossing::{crossing_ratio, detect_crossing};

// Per-segment progress state machine
pub mod attempt;
pub use attempt::{Attempt, AttemptReport, AttemptState, PrPosition};

// Collaborator boundary: segment lists and reference traces
pub mod source;
pub use source::{
    merge_segments, CachedSegmentSource, SegmentSource, StaticSegmentSource, TraceFilter,
};

// Per-subject tracking session
pub mod session;
pub use session::{GpsSample, TrackingSession, TrackingSessionBuilder};

// Shared registry of sessions keyed by subject
pub mod registry;
pub use registry::SessionRegistry;

// ============================================================================
// Core Types
// ============================================================================

/// Identifier of a reference segment.
pub type SegmentId = u64;

/// A GPS coordinate with latitude and longitude.
///
/// Raw input only. Everything past the [`Projection`] works on [`Point`].
///
/// # Example
/// ```
/// use segment_tracker::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A planar point in projected coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<Point> for geo::Point<f64> {
    fn from(p: Point) -> Self {
        geo::Point::new(p.x, p.y)
    }
}

/// A projected point tagged with a timestamp in milliseconds since the Unix epoch.
///
/// Live samples and interpolated crossings both use this shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedPoint {
    pub x: f64,
    pub y: f64,
    pub time: f64,
}

impl TimedPoint {
    pub fn new(x: f64, y: f64, time: f64) -> Self {
        Self { x, y, time }
    }

    /// Position without the timestamp.
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// One sample of a recorded effort, timed from that effort's own start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracePoint {
    pub x: f64,
    pub y: f64,
    pub elapsed_seconds: f64,
}

impl TracePoint {
    pub fn new(x: f64, y: f64, elapsed_seconds: f64) -> Self {
        Self {
            x,
            y,
            elapsed_seconds,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// An ordered, previously recorded traversal of a segment.
///
/// Elapsed times are expected to be non-decreasing. A trace needs at least
/// [`TrackerConfig::min_trace_points`] samples before an attempt will track it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceTrace {
    points: Vec<TracePoint>,
}

impl ReferenceTrace {
    pub fn new(points: Vec<TracePoint>) -> Self {
        Self { points }
    }

    /// Build a trace from parallel position and time streams.
    ///
    /// Times are absolute seconds as delivered by the provider and are
    /// rebased so the first sample sits at zero. Extra samples in the longer
    /// stream are ignored. Returns `None` when either stream is empty.
    pub fn from_streams(
        latlngs: &[GpsPoint],
        times: &[f64],
        projection: &dyn Projection,
    ) -> Option<Self> {
        let first_time = *times.first()?;
        if latlngs.is_empty() {
            return None;
        }

        let points = latlngs
            .iter()
            .zip(times)
            .map(|(latlng, &time)| {
                let p = projection.project(latlng);
                TracePoint::new(p.x, p.y, time - first_time)
            })
            .collect();

        Some(Self { points })
    }

    pub fn points(&self) -> &[TracePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether the trace has enough samples to align against.
    pub fn is_usable(&self, min_points: usize) -> bool {
        self.points.len() >= min_points.max(2)
    }

    /// Total time of the reference effort in seconds.
    pub fn total_seconds(&self) -> Option<f64> {
        self.points.last().map(|p| p.elapsed_seconds)
    }

    /// Where the reference effort was `elapsed_ms` after its start.
    ///
    /// Interpolates between the samples bracketing that instant. Times at or
    /// before the first sample clamp to it; times past the last sample have
    /// no position.
    pub fn position_at(&self, elapsed_ms: f64) -> Option<Point> {
        if self.points.len() < 2 {
            return None;
        }

        let index = self
            .points
            .iter()
            .position(|p| p.elapsed_seconds * 1000.0 > elapsed_ms)?;
        if index == 0 {
            return Some(self.points[0].point());
        }

        let previous = &self.points[index - 1];
        let next = &self.points[index];
        let ratio = (elapsed_ms - previous.elapsed_seconds * 1000.0)
            / ((next.elapsed_seconds - previous.elapsed_seconds) * 1000.0);

        Some(geo_utils::lerp_point(&previous.point(), &next.point(), ratio))
    }
}

/// A reference route descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub name: String,
    pub start: Point,
    pub end: Point,
    /// Total route distance as reported by the provider
    pub distance: f64,
}

impl Segment {
    pub fn new(id: SegmentId, name: &str, start: Point, end: Point, distance: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            start,
            end,
            distance,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for live segment tracking.
///
/// Distance thresholds are in projected units and must be calibrated to the
/// [`Projection`] in use. The defaults match a projection whose units are
/// roughly centimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Coarse region filter: segments whose start is further than this from
    /// the live point are ignored entirely.
    /// Default: 10,000,000
    pub region_threshold: f64,

    /// Distance from a segment start within which a crossing is attempted.
    /// Default: 10,000
    pub near_start_threshold: f64,

    /// Maximum distance between the interpolated crossing and the segment
    /// start for an attempt to open.
    /// Default: 2,000
    pub start_tolerance: f64,

    /// Distance from the aligned trace point beyond which an attempt is
    /// considered lost.
    /// Default: 30,000
    pub abandon_threshold: f64,

    /// How long a finished attempt keeps being reported, in milliseconds.
    /// Default: 5,000
    pub finish_grace_ms: f64,

    /// Trace points examined per hill-climb step when aligning.
    /// Default: 5
    pub alignment_lookahead: usize,

    /// Minimum reference trace length for an attempt to be tracked.
    /// Default: 3
    pub min_trace_points: usize,

    /// Warm the trace cache for segments near their start before a crossing.
    /// Default: true
    pub prefetch_traces: bool,

    /// Give up on an awaited trace fetch after this long and track the
    /// attempt as having no trace. `None` waits indefinitely.
    /// Default: None
    pub trace_fetch_timeout_ms: Option<u64>,

    /// Filter applied when asking for reference efforts.
    pub trace_filter: TraceFilter,

    /// Lifetime of idle tracking sessions in a [`SessionRegistry`].
    /// Default: 600s sliding
    pub session_cache: CacheOptions,

    /// Lifetime of cached candidate segment lists.
    /// Default: 600s absolute
    pub segment_cache: CacheOptions,

    /// Lifetime of cached reference traces.
    /// Default: 600s absolute
    pub trace_cache: CacheOptions,

    /// Interval between background sweeps of expired cache entries.
    /// Default: 120
    pub cache_check_period_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            region_threshold: 10_000_000.0,
            near_start_threshold: 10_000.0,
            start_tolerance: 2_000.0,
            abandon_threshold: 30_000.0,
            finish_grace_ms: 5_000.0,
            alignment_lookahead: 5,
            min_trace_points: 3,
            prefetch_traces: true,
            trace_fetch_timeout_ms: None,
            trace_filter: TraceFilter::default(),
            session_cache: CacheOptions::sliding(cache::DEFAULT_TTL_SECS),
            segment_cache: CacheOptions::absolute(cache::DEFAULT_TTL_SECS),
            trace_cache: CacheOptions::absolute(cache::DEFAULT_TTL_SECS),
            cache_check_period_secs: cache::DEFAULT_CHECK_PERIOD_SECS,
        }
    }
}

impl TrackerConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// ```
    /// use segment_tracker::TrackerConfig;
    ///
    /// let config = TrackerConfig::from_json(r#"{ "start_tolerance": 50.0 }"#).unwrap();
    /// assert_eq!(config.start_tolerance, 50.0);
    /// assert_eq!(config.abandon_threshold, 30_000.0);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackerConfig =
            serde_json::from_str(json).map_err(|e| TrackerError::Config {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that thresholds are usable.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("region_threshold", self.region_threshold),
            ("near_start_threshold", self.near_start_threshold),
            ("start_tolerance", self.start_tolerance),
            ("abandon_threshold", self.abandon_threshold),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value <= 0.0 {
                return Err(TrackerError::Config {
                    message: format!("{} must be a positive number, got {}", name, value),
                });
            }
        }

        if !self.finish_grace_ms.is_finite() || self.finish_grace_ms < 0.0 {
            return Err(TrackerError::Config {
                message: format!("finish_grace_ms must be >= 0, got {}", self.finish_grace_ms),
            });
        }
        if self.alignment_lookahead == 0 {
            return Err(TrackerError::Config {
                message: "alignment_lookahead must be at least 1".to_string(),
            });
        }
        if self.min_trace_points < 2 {
            return Err(TrackerError::Config {
                message: format!("min_trace_points must be at least 2, got {}", self.min_trace_points),
            });
        }
        if self.cache_check_period_secs == 0 {
            return Err(TrackerError::Config {
                message: "cache_check_period_secs must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace() -> ReferenceTrace {
        ReferenceTrace::new(vec![
            TracePoint::new(0.0, 0.0, 0.0),
            TracePoint::new(50.0, 0.0, 10.0),
            TracePoint::new(100.0, 0.0, 20.0),
        ])
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_trace_usable() {
        let trace = sample_trace();
        assert!(trace.is_usable(3));
        assert!(!trace.is_usable(4));
        assert!(!ReferenceTrace::new(vec![TracePoint::new(0.0, 0.0, 0.0)]).is_usable(1));
        assert_eq!(trace.total_seconds(), Some(20.0));
    }

    #[test]
    fn test_position_at_interpolates() {
        let trace = sample_trace();
        assert_eq!(trace.position_at(5_000.0), Some(Point::new(25.0, 0.0)));
        assert_eq!(trace.position_at(15_000.0), Some(Point::new(75.0, 0.0)));
    }

    #[test]
    fn test_position_at_clamps_start() {
        let trace = sample_trace();
        assert_eq!(trace.position_at(0.0), Some(Point::new(0.0, 0.0)));
        assert_eq!(trace.position_at(-250.0), Some(Point::new(0.0, 0.0)));
    }

    #[test]
    fn test_position_at_past_end() {
        let trace = sample_trace();
        assert_eq!(trace.position_at(20_000.0), None);
        assert_eq!(trace.position_at(60_000.0), None);
    }

    #[test]
    fn test_from_streams_rebases_time() {
        let latlngs = vec![
            GpsPoint::new(1.0, 2.0),
            GpsPoint::new(1.5, 2.5),
            GpsPoint::new(2.0, 3.0),
        ];
        let times = vec![1000.0, 1004.0, 1009.0, 1010.0];
        let trace = ReferenceTrace::from_streams(&latlngs, &times, &LngLatProjection).unwrap();

        assert_eq!(trace.len(), 3);
        assert_eq!(trace.points()[0], TracePoint::new(2.0, 1.0, 0.0));
        assert_eq!(trace.points()[2].elapsed_seconds, 9.0);
        assert!(ReferenceTrace::from_streams(&latlngs, &[], &LngLatProjection).is_none());
    }

    #[test]
    fn test_config_defaults_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_trace_points, 3);
        assert!(config.session_cache.sliding_expiration);
        assert!(!config.trace_cache.sliding_expiration);
    }

    #[test]
    fn test_config_from_json_rejects_bad_values() {
        let err = TrackerConfig::from_json(r#"{ "abandon_threshold": -1.0 }"#).unwrap_err();
        assert!(matches!(err, TrackerError::Config { .. }));

        let err = TrackerConfig::from_json(r#"{ "alignment_lookahead": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("alignment_lookahead"));

        assert!(TrackerConfig::from_json("not json").is_err());
    }
}
