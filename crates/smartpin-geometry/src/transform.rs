//! Viewport transform engine
//!
//! Maps between three spaces:
//!
//! ```text
//! normalized (0..1)  --x content-->  world (content px)  --x scale + pan-->  screen (CSS px)
//! ```
//!
//! The engine owns the viewport state of one canvas session. Every mutator
//! that can change scale, viewport size or content size finishes by
//! re-clamping the pan offset:
//!
//! - scaled content larger than the viewport on an axis: pan is kept in
//!   `[viewport - scaled, 0]` so no content edge enters the viewport interior
//! - scaled content smaller than the viewport on an axis: pan is locked to
//!   `(viewport - scaled) / 2`, centering the content on that axis
//!
//! A size change on an axis that was centered keeps the content center at
//! the viewport center, even when the content now overflows that axis.

use crate::point::{clamp_unit, NormalizedPoint, NormalizedRect, ScreenPoint, Size, WorldPoint};

/// Smallest allowed scale
pub const MIN_SCALE: f64 = 0.1;

/// Largest allowed scale
pub const MAX_SCALE: f64 = 10.0;

/// Allowed pan range for both axes
///
/// On a centered axis `min == max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanBounds {
    /// Lowest horizontal pan
    pub min_x: f64,
    /// Highest horizontal pan
    pub max_x: f64,
    /// Lowest vertical pan
    pub min_y: f64,
    /// Highest vertical pan
    pub max_y: f64,
}

impl PanBounds {
    /// Check whether a pan offset lies inside the bounds, with tolerance
    #[inline]
    #[must_use]
    pub fn contains(&self, pan: ScreenPoint, epsilon: f64) -> bool {
        pan.x >= self.min_x - epsilon
            && pan.x <= self.max_x + epsilon
            && pan.y >= self.min_y - epsilon
            && pan.y <= self.max_y + epsilon
    }
}

/// Scale/pan state for one canvas plus the conversions between spaces
///
/// A plain value type: no I/O, never fails. Degenerate geometry (zero-sized
/// content or viewport) is handled by clamping rather than erroring.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformEngine {
    viewport: Size,
    dpr: f64,
    content: Size,
    scale: f64,
    pan: ScreenPoint,
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self {
            viewport: Size::default(),
            dpr: 1.0,
            content: Size::default(),
            scale: 1.0,
            pan: ScreenPoint::default(),
        }
    }
}

impl TransformEngine {
    /// Create engine with empty geometry at scale 1
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create engine with both sizes set and content fitted
    #[must_use]
    pub fn with_geometry(viewport: Size, dpr: f64, content: Size) -> Self {
        let mut engine = Self::new();
        engine.set_viewport_size(viewport.width, viewport.height, dpr);
        engine.set_content_size(content.width, content.height);
        engine.fit_to_viewport(1.0);
        engine
    }

    /// Current scale
    #[inline]
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Current pan offset in screen pixels
    #[inline]
    #[must_use]
    pub fn pan(&self) -> ScreenPoint {
        self.pan
    }

    /// Viewport size in CSS pixels
    #[inline]
    #[must_use]
    pub fn viewport_size(&self) -> Size {
        self.viewport
    }

    /// Content size in content pixels
    #[inline]
    #[must_use]
    pub fn content_size(&self) -> Size {
        self.content
    }

    /// Device pixel ratio
    #[inline]
    #[must_use]
    pub fn dpr(&self) -> f64 {
        self.dpr
    }

    /// Update viewport geometry and re-clamp pan
    pub fn set_viewport_size(&mut self, width: f64, height: f64, dpr: f64) {
        let centered = self.centered_axes();
        self.viewport = Size::new(width, height);
        self.dpr = if dpr.is_finite() && dpr > 0.0 { dpr } else { 1.0 };
        self.recenter(centered);
    }

    /// Update content geometry and re-clamp pan
    pub fn set_content_size(&mut self, width: f64, height: f64) {
        let centered = self.centered_axes();
        self.content = Size::new(width, height);
        self.recenter(centered);
    }

    /// Set scale anchored at the viewport center
    pub fn set_scale(&mut self, scale: f64) {
        if !scale.is_finite() || scale <= 0.0 {
            return;
        }
        let center = self.viewport_center();
        self.zoom_to(scale, center);
    }

    /// Drag the view by a screen-space delta
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        if !dx.is_finite() || !dy.is_finite() {
            return;
        }
        self.pan.x += dx;
        self.pan.y += dy;
        self.clamp_pan();
    }

    /// Screen pixels to world (content) pixels
    #[inline]
    #[must_use]
    pub fn screen_to_world(&self, screen: ScreenPoint) -> WorldPoint {
        WorldPoint::new(
            (screen.x - self.pan.x) / self.scale,
            (screen.y - self.pan.y) / self.scale,
        )
    }

    /// World (content) pixels to screen pixels
    #[inline]
    #[must_use]
    pub fn world_to_screen(&self, world: WorldPoint) -> ScreenPoint {
        ScreenPoint::new(
            world.x * self.scale + self.pan.x,
            world.y * self.scale + self.pan.y,
        )
    }

    /// Screen pixels to normalized coordinates, each axis clamped to `[0, 1]`
    #[must_use]
    pub fn screen_to_normalized(&self, sx: f64, sy: f64) -> NormalizedPoint {
        let world = self.screen_to_world(ScreenPoint::new(sx, sy));
        NormalizedPoint::new(
            normalize_axis(world.x, self.content.width),
            normalize_axis(world.y, self.content.height),
        )
    }

    /// Normalized coordinates to screen pixels, unclamped
    ///
    /// Points outside `[0, 1]` map outside the content, which rendering
    /// relies on for entities animating in from off-screen.
    #[must_use]
    pub fn normalized_to_screen(&self, x: f64, y: f64) -> ScreenPoint {
        self.world_to_screen(WorldPoint::new(
            x * self.content.width,
            y * self.content.height,
        ))
    }

    /// Zoom by `factor` keeping the world point under the pointer fixed
    ///
    /// The resulting scale is clamped to `[MIN_SCALE, MAX_SCALE]`. Non-finite
    /// or non-positive factors are ignored.
    pub fn zoom_at_pointer(&mut self, factor: f64, px: f64, py: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        self.zoom_to(self.scale * factor, ScreenPoint::new(px, py));
    }

    /// Fit the content inside the viewport, scaled by `padding_factor`, centered
    pub fn fit_to_viewport(&mut self, padding_factor: f64) {
        if self.content.is_empty() || self.viewport.is_empty() {
            return;
        }
        let padding = if padding_factor.is_finite() && padding_factor > 0.0 {
            padding_factor
        } else {
            1.0
        };
        let fit = (self.viewport.width / self.content.width)
            .min(self.viewport.height / self.content.height);
        self.scale = clamp_scale(fit * padding);
        self.pan = ScreenPoint::new(
            (self.viewport.width - self.content.width * self.scale) / 2.0,
            (self.viewport.height - self.content.height * self.scale) / 2.0,
        );
        self.clamp_pan();
    }

    /// Pan so the given normalized point lands at the viewport center
    pub fn center_on_normalized(&mut self, x: f64, y: f64) {
        let center = self.viewport_center();
        let wx = clamp_unit(x) * self.content.width;
        let wy = clamp_unit(y) * self.content.height;
        self.pan = ScreenPoint::new(center.x - wx * self.scale, center.y - wy * self.scale);
        self.clamp_pan();
    }

    /// Normalized bounding box of what is currently on screen
    #[must_use]
    pub fn visible_area_normalized(&self) -> NormalizedRect {
        let top_left = self.screen_to_normalized(0.0, 0.0);
        let bottom_right = self.screen_to_normalized(self.viewport.width, self.viewport.height);
        NormalizedRect::from_corners(top_left, bottom_right)
    }

    /// Convert a screen-pixel radius into normalized extents per axis
    #[must_use]
    pub fn screen_tolerance_to_normalized(&self, px: f64) -> (f64, f64) {
        let world = px.abs() / self.scale;
        (
            if self.content.width > 0.0 { world / self.content.width } else { 0.0 },
            if self.content.height > 0.0 { world / self.content.height } else { 0.0 },
        )
    }

    /// CSS pixels to backing-store pixels
    #[inline]
    #[must_use]
    pub fn to_device_pixels(&self, screen: ScreenPoint) -> (f64, f64) {
        (screen.x * self.dpr, screen.y * self.dpr)
    }

    /// Backing-store size for the canvas
    #[inline]
    #[must_use]
    pub fn device_size(&self) -> Size {
        Size::new(
            (self.viewport.width * self.dpr).round(),
            (self.viewport.height * self.dpr).round(),
        )
    }

    /// Allowed pan range under the current geometry
    #[must_use]
    pub fn pan_bounds(&self) -> PanBounds {
        let (min_x, max_x) = axis_bounds(self.viewport.width, self.content.width * self.scale);
        let (min_y, max_y) = axis_bounds(self.viewport.height, self.content.height * self.scale);
        PanBounds {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    fn zoom_to(&mut self, target_scale: f64, anchor: ScreenPoint) {
        let world = self.screen_to_world(anchor);
        self.scale = clamp_scale(target_scale);
        self.pan = ScreenPoint::new(
            anchor.x - world.x * self.scale,
            anchor.y - world.y * self.scale,
        );
        self.clamp_pan();
    }

    fn centered_axes(&self) -> (bool, bool) {
        let bounds = self.pan_bounds();
        (bounds.min_x == bounds.max_x, bounds.min_y == bounds.max_y)
    }

    fn recenter(&mut self, (x, y): (bool, bool)) {
        if x {
            self.pan.x = (self.viewport.width - self.content.width * self.scale) / 2.0;
        }
        if y {
            self.pan.y = (self.viewport.height - self.content.height * self.scale) / 2.0;
        }
        self.clamp_pan();
    }

    fn clamp_pan(&mut self) {
        self.pan.x = clamp_axis(self.pan.x, self.viewport.width, self.content.width * self.scale);
        self.pan.y = clamp_axis(self.pan.y, self.viewport.height, self.content.height * self.scale);
    }

    fn viewport_center(&self) -> ScreenPoint {
        ScreenPoint::new(self.viewport.width / 2.0, self.viewport.height / 2.0)
    }
}

#[inline]
fn clamp_scale(scale: f64) -> f64 {
    scale.clamp(MIN_SCALE, MAX_SCALE)
}

#[inline]
fn normalize_axis(world: f64, extent: f64) -> f64 {
    if extent > 0.0 {
        clamp_unit(world / extent)
    } else {
        0.0
    }
}

fn axis_bounds(viewport: f64, scaled: f64) -> (f64, f64) {
    if scaled >= viewport {
        (viewport - scaled, 0.0)
    } else {
        let centered = (viewport - scaled) / 2.0;
        (centered, centered)
    }
}

fn clamp_axis(pan: f64, viewport: f64, scaled: f64) -> f64 {
    let (min, max) = axis_bounds(viewport, scaled);
    if pan.is_finite() {
        pan.clamp(min, max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn engine(vw: f64, vh: f64, cw: f64, ch: f64) -> TransformEngine {
        let mut e = TransformEngine::new();
        e.set_viewport_size(vw, vh, 1.0);
        e.set_content_size(cw, ch);
        e
    }

    #[test]
    fn zoom_keeps_pointer_anchor() {
        // 800x600 viewport, 1000x700 content, scale 1 -> 3 at (400, 300)
        let mut e = engine(800.0, 600.0, 1000.0, 700.0);
        assert_eq!(e.scale(), 1.0);
        let before = e.screen_to_world(ScreenPoint::new(400.0, 300.0));

        e.zoom_at_pointer(3.0, 400.0, 300.0);

        assert!((e.scale() - 3.0).abs() < EPS);
        let after = e.world_to_screen(before);
        assert!((after.x - 400.0).abs() < EPS);
        assert!((after.y - 300.0).abs() < EPS);
        assert!((e.pan().x - (400.0 - before.x * 3.0)).abs() < EPS);
        assert!((e.pan().y - (300.0 - before.y * 3.0)).abs() < EPS);
    }

    #[test]
    fn zoom_scale_is_clamped() {
        let mut e = engine(800.0, 600.0, 1000.0, 700.0);
        e.zoom_at_pointer(1000.0, 10.0, 10.0);
        assert_eq!(e.scale(), MAX_SCALE);
        e.zoom_at_pointer(1e-6, 10.0, 10.0);
        assert_eq!(e.scale(), MIN_SCALE);
    }

    #[test]
    fn invalid_zoom_factor_is_ignored() {
        let mut e = engine(800.0, 600.0, 1000.0, 700.0);
        let before = e.clone();
        e.zoom_at_pointer(0.0, 1.0, 1.0);
        e.zoom_at_pointer(f64::NAN, 1.0, 1.0);
        e.zoom_at_pointer(-2.0, 1.0, 1.0);
        assert_eq!(e, before);
    }

    #[test]
    fn small_content_is_centered() {
        let mut e = engine(800.0, 600.0, 400.0, 300.0);
        e.pan_by(-500.0, 200.0);
        assert_eq!(e.pan(), ScreenPoint::new(200.0, 150.0));
    }

    #[test]
    fn large_content_pan_is_bounded() {
        let mut e = engine(800.0, 600.0, 1000.0, 700.0);
        e.pan_by(500.0, 500.0);
        assert_eq!(e.pan(), ScreenPoint::new(0.0, 0.0));
        e.pan_by(-5000.0, -5000.0);
        assert_eq!(e.pan(), ScreenPoint::new(-200.0, -100.0));
    }

    #[test]
    fn fit_to_viewport_centers_scaled_content() {
        let mut e = engine(800.0, 600.0, 1600.0, 600.0);
        e.fit_to_viewport(0.9);
        assert!((e.scale() - 0.45).abs() < EPS);
        assert!((e.pan().x - (800.0 - 1600.0 * 0.45) / 2.0).abs() < EPS);
        assert!((e.pan().y - (600.0 - 600.0 * 0.45) / 2.0).abs() < EPS);
    }

    #[test]
    fn center_on_normalized_moves_point_to_middle() {
        let mut e = engine(800.0, 600.0, 1000.0, 700.0);
        e.set_scale(4.0);
        e.center_on_normalized(0.5, 0.5);
        let s = e.normalized_to_screen(0.5, 0.5);
        assert!((s.x - 400.0).abs() < EPS);
        assert!((s.y - 300.0).abs() < EPS);
    }

    #[test]
    fn center_near_edge_respects_clamp() {
        let mut e = engine(800.0, 600.0, 1000.0, 700.0);
        e.set_scale(2.0);
        e.center_on_normalized(0.0, 0.0);
        assert_eq!(e.pan(), ScreenPoint::new(0.0, 0.0));
    }

    #[test]
    fn screen_to_normalized_clamps_outside_points() {
        let e = engine(800.0, 600.0, 400.0, 300.0);
        // content occupies [200, 600] x [150, 450]
        assert_eq!(e.screen_to_normalized(0.0, 0.0), NormalizedPoint::new(0.0, 0.0));
        assert_eq!(e.screen_to_normalized(800.0, 600.0), NormalizedPoint::new(1.0, 1.0));
        assert_eq!(e.screen_to_normalized(400.0, 300.0), NormalizedPoint::new(0.5, 0.5));
    }

    #[test]
    fn normalized_to_screen_is_unclamped() {
        let e = engine(800.0, 600.0, 400.0, 300.0);
        let s = e.normalized_to_screen(-1.0, 2.0);
        assert_eq!(s, ScreenPoint::new(-200.0, 750.0));
    }

    #[test]
    fn visible_area_of_zoomed_view() {
        let mut e = engine(800.0, 600.0, 800.0, 600.0);
        e.set_scale(2.0);
        let area = e.visible_area_normalized();
        assert!((area.min_x - 0.25).abs() < EPS);
        assert!((area.max_x - 0.75).abs() < EPS);
        assert!((area.min_y - 0.25).abs() < EPS);
        assert!((area.max_y - 0.75).abs() < EPS);
    }

    #[test]
    fn centered_pan_survives_content_growth() {
        let mut e = engine(800.0, 600.0, 400.0, 300.0);
        assert_eq!(e.pan(), ScreenPoint::new(200.0, 150.0));
        e.set_content_size(1000.0, 700.0);
        assert_eq!(e.pan(), ScreenPoint::new(-100.0, -50.0));
        let center = e.normalized_to_screen(0.5, 0.5);
        assert_eq!(center, ScreenPoint::new(400.0, 300.0));

        // no longer centered: further growth only clamps
        e.pan_by(-50.0, 0.0);
        e.set_content_size(1600.0, 1000.0);
        assert_eq!(e.pan(), ScreenPoint::new(-150.0, -50.0));
        assert!(e.pan_bounds().contains(e.pan(), EPS));
    }

    #[test]
    fn viewport_shrink_keeps_centered_content_centered() {
        let mut e = engine(800.0, 600.0, 600.0, 400.0);
        e.set_viewport_size(500.0, 300.0, 1.0);
        assert_eq!(e.pan(), ScreenPoint::new(-50.0, -50.0));
    }

    #[test]
    fn empty_content_maps_to_origin() {
        let e = engine(800.0, 600.0, 0.0, 0.0);
        assert_eq!(e.screen_to_normalized(123.0, 456.0), NormalizedPoint::new(0.0, 0.0));
        assert_eq!(e.screen_tolerance_to_normalized(10.0), (0.0, 0.0));
    }

    #[test]
    fn device_pixels_follow_dpr() {
        let mut e = engine(800.0, 600.0, 800.0, 600.0);
        e.set_viewport_size(800.0, 600.0, 2.0);
        assert_eq!(e.to_device_pixels(ScreenPoint::new(10.0, 20.0)), (20.0, 40.0));
        assert_eq!(e.device_size(), Size::new(1600.0, 1200.0));
        e.set_viewport_size(800.0, 600.0, 0.0);
        assert_eq!(e.dpr(), 1.0);
    }

    #[test]
    fn tolerance_shrinks_with_zoom() {
        let mut e = engine(800.0, 600.0, 1000.0, 500.0);
        let (tx1, ty1) = e.screen_tolerance_to_normalized(10.0);
        e.set_scale(2.0);
        let (tx2, ty2) = e.screen_tolerance_to_normalized(10.0);
        assert!((tx1 - 0.01).abs() < EPS);
        assert!((ty1 - 0.02).abs() < EPS);
        assert!((tx2 - 0.005).abs() < EPS);
        assert!((ty2 - 0.01).abs() < EPS);
    }
}
