//! # Geometry Utilities
//!
//! Planar computations shared by the crossing detector and the progress tracker.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`distance`] | Euclidean distance between two projected points |
//! | [`lerp`] | Linear interpolation of position and time between two samples |
//! | [`lerp_point`] | Linear interpolation of position only |
//!
//! ## Example
//!
//! ```rust
//! use segment_tracker::{Point, TimedPoint, geo_utils};
//!
//! let a = TimedPoint::new(0.0, 0.0, 1_000.0);
//! let b = TimedPoint::new(10.0, 0.0, 2_000.0);
//!
//! let mid = geo_utils::lerp(&a, &b, 0.5);
//! assert_eq!(mid.point(), Point::new(5.0, 0.0));
//! assert_eq!(mid.time, 1_500.0);
//!
//! assert_eq!(geo_utils::distance(&a.point(), &b.point()), 10.0);
//! ```
//!
//! ## Coordinate System
//!
//! All inputs are in the planar space produced by the caller's
//! [`Projection`](crate::projection::Projection). Distances are Euclidean in
//! that space and carry whatever units the projection uses.

use geo::{Distance, Euclidean};

use crate::{Point, TimedPoint};

/// Euclidean distance between two projected points.
///
/// ```rust
/// use segment_tracker::{Point, geo_utils};
///
/// let d = geo_utils::distance(&Point::new(0.0, 0.0), &Point::new(3.0, 4.0));
/// assert_eq!(d, 5.0);
/// ```
#[inline]
pub fn distance(a: &Point, b: &Point) -> f64 {
    Euclidean::distance(geo::Point::from(*a), geo::Point::from(*b))
}

/// Interpolate between two timed samples.
///
/// `ratio` of 0 yields `a`, 1 yields `b`. Position and time move together, so
/// the result is where the subject was at the interpolated instant assuming
/// constant speed between samples.
pub fn lerp(a: &TimedPoint, b: &TimedPoint, ratio: f64) -> TimedPoint {
    TimedPoint {
        x: a.x + (b.x - a.x) * ratio,
        y: a.y + (b.y - a.y) * ratio,
        time: a.time + (b.time - a.time) * ratio,
    }
}

/// Interpolate position only.
#[inline]
pub fn lerp_point(a: &Point, b: &Point, ratio: f64) -> Point {
    Point::new(a.x + (b.x - a.x) * ratio, a.y + (b.y - a.y) * ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_distance_same_point() {
        let p = Point::new(1234.5, -987.25);
        assert_eq!(distance(&p, &p), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Point::new(-5.0, 12.0);
        let b = Point::new(7.5, -3.0);
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert!(approx_eq(distance(&a, &b), (12.5f64.powi(2) + 15.0f64.powi(2)).sqrt(), 1e-9));
    }

    #[test]
    fn test_lerp_endpoints() {
        let a = TimedPoint::new(-5.0, 2.0, 10_000.0);
        let b = TimedPoint::new(5.0, 8.0, 11_000.0);
        assert_eq!(lerp(&a, &b, 0.0), a);
        assert_eq!(lerp(&a, &b, 1.0), b);
    }

    #[test]
    fn test_lerp_midpoint_moves_time() {
        let a = TimedPoint::new(0.0, 0.0, 0.0);
        let b = TimedPoint::new(100.0, -50.0, 4_000.0);
        let p = lerp(&a, &b, 0.25);
        assert!(approx_eq(p.x, 25.0, 1e-9));
        assert!(approx_eq(p.y, -12.5, 1e-9));
        assert!(approx_eq(p.time, 1_000.0, 1e-9));
    }

    #[test]
    fn test_lerp_point() {
        let p = lerp_point(&Point::new(0.0, 10.0), &Point::new(10.0, 20.0), 0.5);
        assert_eq!(p, Point::new(5.0, 15.0));
    }
}
