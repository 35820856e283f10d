//! SmartPin Cache
//!
//! Reactive, normalized store of the entities of each collaboration scope:
//! - [`ScopeSnapshot`]: persistent-map snapshot with spatial queries
//! - [`Patch`]: structural changes, each one idempotent on replay
//! - [`EntityCache`]: per-scope snapshots published over watch channels
//!
//! # Example
//!
//! ```rust
//! use smartpin_cache::{EntityCache, Patch};
//! use smartpin_geometry::NormalizedPoint;
//! use smartpin_model::{Entity, EntityId, LayerId, Marker, ScopeId};
//!
//! let cache = EntityCache::new();
//! let scope = ScopeId::new("roof-1");
//! let marker = Marker::new(
//!     EntityId::placeholder(),
//!     scope.clone(),
//!     LayerId::new("base"),
//!     NormalizedPoint::new(0.4, 0.6),
//!     1,
//! );
//!
//! cache.apply(&scope, &Patch::Insert(Entity::Marker(marker)));
//! assert_eq!(cache.get(&scope).marker_count(), 1);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cache;
pub mod patch;
pub mod snapshot;

pub use cache::{CallbackSubscription, EntityCache, SnapshotWatcher};
pub use patch::Patch;
pub use snapshot::{MarkerFilter, ScopeSnapshot};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
