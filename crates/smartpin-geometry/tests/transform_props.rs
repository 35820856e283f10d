//! Property tests for the viewport transform invariants.

use proptest::prelude::*;
use smartpin_geometry::{ScreenPoint, TransformEngine, MAX_SCALE, MIN_SCALE};

const EPS: f64 = 1e-6;

fn engine_with(vw: f64, vh: f64, cw: f64, ch: f64, scale: f64) -> TransformEngine {
    let mut engine = TransformEngine::new();
    engine.set_viewport_size(vw, vh, 1.0);
    engine.set_content_size(cw, ch);
    engine.set_scale(scale);
    engine
}

#[derive(Debug, Clone)]
enum Step {
    Scale(f64),
    Viewport(f64, f64),
    Content(f64, f64),
    Zoom(f64, f64, f64),
    Pan(f64, f64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0.01f64..20.0).prop_map(Step::Scale),
        (1.0f64..3000.0, 1.0f64..3000.0).prop_map(|(w, h)| Step::Viewport(w, h)),
        (1.0f64..5000.0, 1.0f64..5000.0).prop_map(|(w, h)| Step::Content(w, h)),
        (0.05f64..8.0, 0.0f64..3000.0, 0.0f64..3000.0).prop_map(|(f, x, y)| Step::Zoom(f, x, y)),
        (-5000.0f64..5000.0, -5000.0f64..5000.0).prop_map(|(x, y)| Step::Pan(x, y)),
    ]
}

proptest! {
    #[test]
    fn normalized_round_trip(
        vw in 10.0f64..4000.0,
        vh in 10.0f64..4000.0,
        cw in 10.0f64..6000.0,
        ch in 10.0f64..6000.0,
        scale in MIN_SCALE..MAX_SCALE,
        x in 0.0f64..=1.0,
        y in 0.0f64..=1.0,
    ) {
        let engine = engine_with(vw, vh, cw, ch, scale);
        let screen = engine.normalized_to_screen(x, y);
        let back = engine.screen_to_normalized(screen.x, screen.y);
        prop_assert!((back.x - x).abs() < EPS, "x {} -> {}", x, back.x);
        prop_assert!((back.y - y).abs() < EPS, "y {} -> {}", y, back.y);
    }

    #[test]
    fn zoom_in_preserves_anchor_when_content_covers_viewport(
        vw in 100.0f64..2000.0,
        vh in 100.0f64..2000.0,
        extra in 1.0f64..3.0,
        factor in 1.0f64..3.0,
        fx in 0.0f64..=1.0,
        fy in 0.0f64..=1.0,
    ) {
        let mut engine = engine_with(vw, vh, vw * extra, vh * extra, 1.0);
        let pointer = ScreenPoint::new(fx * vw, fy * vh);
        let world = engine.screen_to_world(pointer);

        engine.zoom_at_pointer(factor, pointer.x, pointer.y);

        let after = engine.world_to_screen(world);
        prop_assert!((after.x - pointer.x).abs() < EPS);
        prop_assert!((after.y - pointer.y).abs() < EPS);
    }

    #[test]
    fn pan_stays_in_bounds(steps in proptest::collection::vec(step(), 1..40)) {
        let mut engine = engine_with(800.0, 600.0, 1000.0, 700.0, 1.0);
        for s in steps {
            match s {
                Step::Scale(v) => engine.set_scale(v),
                Step::Viewport(w, h) => engine.set_viewport_size(w, h, 1.0),
                Step::Content(w, h) => engine.set_content_size(w, h),
                Step::Zoom(f, x, y) => engine.zoom_at_pointer(f, x, y),
                Step::Pan(x, y) => engine.pan_by(x, y),
            }
            prop_assert!(engine.scale() >= MIN_SCALE && engine.scale() <= MAX_SCALE);
            prop_assert!(engine.pan_bounds().contains(engine.pan(), EPS));
        }
    }

    #[test]
    fn visible_area_is_inside_unit_square(
        scale in MIN_SCALE..MAX_SCALE,
        px in -3000.0f64..3000.0,
        py in -3000.0f64..3000.0,
    ) {
        let mut engine = engine_with(800.0, 600.0, 1000.0, 700.0, scale);
        engine.pan_by(px, py);
        let area = engine.visible_area_normalized();
        prop_assert!(area.min_x >= 0.0 && area.max_x <= 1.0);
        prop_assert!(area.min_y >= 0.0 && area.max_y <= 1.0);
        prop_assert!(area.min_x <= area.max_x && area.min_y <= area.max_y);
    }
}
