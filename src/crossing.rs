//! # Crossing Detection
//!
//! Live samples arrive seconds apart, so the moment the subject was nearest a
//! target (a segment start or end, or one sample of a reference trace) almost
//! always falls between two samples.
//!
//! A target counts as crossed between `last` and `current` when it is closer
//! to each of them than they are to each other. The crossing is then placed
//! on the `last -> current` line at `|last, target| / |last, current|` and
//! its time interpolated the same way.
//!
//! This is a cheap, symmetric heuristic rather than a closest-point
//! projection. It is used both for start/finish lines and for aligning to
//! individual trace samples.
//!
//! ```rust
//! use segment_tracker::{Point, TimedPoint, detect_crossing};
//!
//! let last = TimedPoint::new(-5.0, 0.0, 0.0);
//! let current = TimedPoint::new(5.0, 0.0, 1_000.0);
//!
//! let crossing = detect_crossing(&last, &current, &Point::new(0.0, 0.0)).unwrap();
//! assert_eq!(crossing.time, 500.0);
//!
//! assert!(detect_crossing(&last, &current, &Point::new(50.0, 0.0)).is_none());
//! ```

use crate::geo_utils::{distance, lerp};
use crate::{Point, TimedPoint};

/// Fraction of the way from `last` to `current` at which `target` is passed,
/// or `None` if `target` does not lie between the two samples.
pub fn crossing_ratio(last: &Point, current: &Point, target: &Point) -> Option<f64> {
    let last_to_current = distance(last, current);
    let last_to_target = distance(last, target);
    let current_to_target = distance(current, target);

    if last_to_target < last_to_current && current_to_target < last_to_current {
        Some(last_to_target / last_to_current)
    } else {
        None
    }
}

/// Interpolated point and time at which the path `last -> current` passed
/// `target`, or `None` if it did not.
pub fn detect_crossing(last: &TimedPoint, current: &TimedPoint, target: &Point) -> Option<TimedPoint> {
    let ratio = crossing_ratio(&last.point(), &current.point(), target)?;
    Some(lerp(last, current, ratio))
}
