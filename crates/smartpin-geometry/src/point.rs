//! Point, size and rectangle types for the three coordinate spaces
//!
//! - Normalized: fractions of the content extent, persisted with entities
//! - World: content pixels at scale 1
//! - Screen: CSS pixels relative to the viewport's top-left corner

use serde::{Deserialize, Serialize};

/// Position expressed as fractions of the content extent
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedPoint {
    /// Horizontal fraction
    pub x: f64,
    /// Vertical fraction
    pub y: f64,
}

impl NormalizedPoint {
    /// Create a point without clamping
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Create a point with each axis clamped to `[0, 1]`
    #[inline]
    #[must_use]
    pub fn clamped(x: f64, y: f64) -> Self {
        Self {
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }

    /// Check both axes lie in `[0, 1]`
    #[inline]
    #[must_use]
    pub fn is_in_unit_square(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }

    /// Euclidean distance in normalized units
    #[inline]
    #[must_use]
    pub fn distance(&self, other: &Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Content pixel position at scale 1
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorldPoint {
    /// Horizontal content pixels
    pub x: f64,
    /// Vertical content pixels
    pub y: f64,
}

impl WorldPoint {
    /// Create world point
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Viewport position in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenPoint {
    /// Horizontal CSS pixels
    pub x: f64,
    /// Vertical CSS pixels
    pub y: f64,
}

impl ScreenPoint {
    /// Create screen point
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width/height pair
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    /// Width
    pub width: f64,
    /// Height
    pub height: f64,
}

impl Size {
    /// Create size, negative and non-finite extents collapse to zero
    #[inline]
    #[must_use]
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: sanitize_extent(width),
            height: sanitize_extent(height),
        }
    }

    /// True when either extent is zero
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Axis-aligned rectangle in normalized space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    /// Left edge
    pub min_x: f64,
    /// Top edge
    pub min_y: f64,
    /// Right edge
    pub max_x: f64,
    /// Bottom edge
    pub max_y: f64,
}

impl NormalizedRect {
    /// The whole content extent
    pub const FULL: Self = Self {
        min_x: 0.0,
        min_y: 0.0,
        max_x: 1.0,
        max_y: 1.0,
    };

    /// Bounding box of two corner points
    #[inline]
    #[must_use]
    pub fn from_corners(a: NormalizedPoint, b: NormalizedPoint) -> Self {
        Self {
            min_x: a.x.min(b.x),
            min_y: a.y.min(b.y),
            max_x: a.x.max(b.x),
            max_y: a.y.max(b.y),
        }
    }

    /// Check whether the point lies inside (edges inclusive)
    #[inline]
    #[must_use]
    pub fn contains(&self, point: &NormalizedPoint) -> bool {
        point.x >= self.min_x && point.x <= self.max_x && point.y >= self.min_y && point.y <= self.max_y
    }

    /// Grow every edge by `margin`, clamped to the unit square
    #[inline]
    #[must_use]
    pub fn inflate(&self, margin: f64) -> Self {
        Self {
            min_x: clamp_unit(self.min_x - margin),
            min_y: clamp_unit(self.min_y - margin),
            max_x: clamp_unit(self.max_x + margin),
            max_y: clamp_unit(self.max_y + margin),
        }
    }
}

#[inline]
pub(crate) fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[inline]
fn sanitize_extent(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_point_stays_in_unit_square() {
        let p = NormalizedPoint::clamped(-0.5, 1.7);
        assert_eq!(p, NormalizedPoint::new(0.0, 1.0));
        assert!(p.is_in_unit_square());
        assert_eq!(NormalizedPoint::clamped(f64::NAN, 0.3).x, 0.0);
    }

    #[test]
    fn rect_from_corners_orders_edges() {
        let r = NormalizedRect::from_corners(NormalizedPoint::new(0.8, 0.1), NormalizedPoint::new(0.2, 0.6));
        assert_eq!(r.min_x, 0.2);
        assert_eq!(r.max_x, 0.8);
        assert!(r.contains(&NormalizedPoint::new(0.5, 0.5)));
        assert!(!r.contains(&NormalizedPoint::new(0.9, 0.5)));
    }

    #[test]
    fn size_rejects_negative_extents() {
        assert!(Size::new(-3.0, 10.0).is_empty());
        assert!(Size::new(f64::INFINITY, 10.0).is_empty());
        assert!(!Size::new(3.0, 10.0).is_empty());
    }
}
