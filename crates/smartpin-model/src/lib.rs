//! SmartPin Model
//!
//! Data model of the inspection platform:
//! - [`Marker`]: top-level pin with a normalized position
//! - [`ChildIssue`]: issue nested under a marker, tracked to closure
//! - [`Layer`]: visibility, lock and write-role gating
//! - [`EntityId`]: local/remote identity pair used for optimistic writes
//! - [`Rollup`]: status counts derived from a marker's children
//! - wire records and change events exchanged with the backend

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod child;
pub mod entity;
pub mod error;
pub mod ids;
pub mod layer;
pub mod marker;
pub mod record;
pub mod rollup;
pub mod status;

pub use child::{ChildCode, ChildIssue, PhotoKind, PhotoRef};
pub use entity::{Entity, EntityRef};
pub use error::ModelError;
pub use ids::{EntityId, LayerId, LocalId, PhotoId, RemoteId, ScopeId, UserId, PLACEHOLDER_PREFIX};
pub use layer::{Layer, Role};
pub use marker::Marker;
pub use record::{ChangeEvent, ChildRecord, MarkerRecord, Record, RecordKey, ScopeRecords};
pub use rollup::{recompute, MixedState, Rollup};
pub use status::{allowed_transitions, validate_transition, Severity, Status};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
