//! Coordinate projection from geographic to planar space.
//!
//! The tracker never works on latitude/longitude directly. Callers supply a
//! [`Projection`] that maps raw GPS input into whatever planar space their
//! segments and reference traces live in.

use crate::{GpsPoint, Point};

/// Maps a geographic coordinate into the planar space used for matching.
pub trait Projection: Send + Sync {
    fn project(&self, point: &GpsPoint) -> Point;
}

impl<F> Projection for F
where
    F: Fn(&GpsPoint) -> Point + Send + Sync,
{
    fn project(&self, point: &GpsPoint) -> Point {
        self(point)
    }
}

/// Identity mapping: `x` is longitude, `y` is latitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct LngLatProjection;

impl Projection for LngLatProjection {
    fn project(&self, point: &GpsPoint) -> Point {
        Point::new(point.longitude, point.latitude)
    }
}
