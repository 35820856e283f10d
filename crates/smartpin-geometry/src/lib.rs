//! SmartPin Geometry
//!
//! Coordinate transforms between the persisted normalized representation of
//! pin positions and a zoomable, pannable on-screen viewport.
//!
//! # Example
//!
//! ```rust
//! use smartpin_geometry::{Size, TransformEngine};
//!
//! let mut engine = TransformEngine::with_geometry(
//!     Size::new(800.0, 600.0),
//!     2.0,
//!     Size::new(1000.0, 700.0),
//! );
//! engine.zoom_at_pointer(3.0, 400.0, 300.0);
//!
//! let pin = engine.screen_to_normalized(400.0, 300.0);
//! assert!(pin.is_in_unit_square());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod point;
mod transform;

pub use point::{NormalizedPoint, NormalizedRect, ScreenPoint, Size, WorldPoint};
pub use transform::{PanBounds, TransformEngine, MAX_SCALE, MIN_SCALE};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
