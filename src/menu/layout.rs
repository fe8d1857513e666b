//! Placement math for radial menus.
//!
//! Everything here is pure: angles are in degrees, screen coordinates grow
//! right and down, and positions are the top-left corner of an item's square.

use serde::{Deserialize, Serialize};

const FULL_CIRCLE: f64 = 360.0;
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Linear interpolation, `t` in `[0, 1]`.
    pub fn lerp(self, to: Point, t: f64) -> Self {
        Self::new(self.x + (to.x - self.x) * t, self.y + (to.y - self.y) * t)
    }
}

/// Angular range a node's children are spread over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngularSpan {
    pub start: f64,
    pub end: f64,
}

impl AngularSpan {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn full() -> Self {
        Self::new(0.0, FULL_CIRCLE)
    }

    pub fn width(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_full_circle(&self) -> bool {
        (self.width() - FULL_CIRCLE).abs() < EPSILON
    }
}

impl Default for AngularSpan {
    fn default() -> Self {
        Self::full()
    }
}

/// Angles (degrees) for `count` siblings.
///
/// A full circle divides by `count` so the last item does not land on top of
/// the first; a fan divides by `count - 1` so both ends are pinned.
pub fn item_angles(span: AngularSpan, count: usize) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    let divisor = if span.is_full_circle() {
        count
    } else {
        (count - 1).max(1)
    };
    let step = span.width() / divisor as f64;
    (0..count).map(|i| span.start + i as f64 * step).collect()
}

/// Points on the ring itself, one per sibling.
pub fn ring_centers(center: Point, radius: f64, span: AngularSpan, count: usize) -> Vec<Point> {
    let radius = if radius.is_finite() { radius.max(0.0) } else { 0.0 };
    item_angles(span, count)
        .into_iter()
        .map(|deg| {
            let rad = deg.to_radians();
            center.offset(radius * rad.cos(), radius * rad.sin())
        })
        .collect()
}

/// Top-left positions of `count` squares of side `item_size` centered on the ring.
pub fn ring_positions(
    center: Point,
    radius: f64,
    span: AngularSpan,
    count: usize,
    item_size: f64,
) -> Vec<Point> {
    let half = item_size / 2.0;
    ring_centers(center, radius, span, count)
        .into_iter()
        .map(|p| p.offset(-half, -half))
        .collect()
}

/// Top-left corner of a square of side `size` centered on `center`.
pub fn centered(center: Point, size: f64) -> Point {
    center.offset(-size / 2.0, -size / 2.0)
}
