//! Top-level spatial entity

use crate::ids::{EntityId, LayerId, ScopeId};
use crate::rollup::Rollup;
use crate::status::{Severity, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smartpin_geometry::NormalizedPoint;

/// A pin placed on the structure image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Identity
    pub id: EntityId,
    /// Owning structure/region
    pub scope: ScopeId,
    /// Layer this marker is drawn on
    pub layer: LayerId,
    /// Normalized position in `[0, 1]²`
    pub position: NormalizedPoint,
    /// Inspection status
    pub status: Status,
    /// Defect severity
    pub severity: Severity,
    /// Scope-sequential number, prefix of child codes
    pub seq: u32,
    /// Highest child index handed out so far, never decremented
    pub next_child_index: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last activity on the marker or its children
    pub last_activity_at: DateTime<Utc>,
    /// Server revision, 0 for placeholders
    pub revision: u64,
    /// Derived child counts
    pub rollup: Rollup,
}

impl Marker {
    /// New open marker with no children
    #[must_use]
    pub fn new(id: EntityId, scope: ScopeId, layer: LayerId, position: NormalizedPoint, seq: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            scope,
            layer,
            position,
            status: Status::Open,
            severity: Severity::default(),
            seq,
            next_child_index: 0,
            created_at: now,
            last_activity_at: now,
            revision: 0,
            rollup: Rollup::default(),
        }
    }

    /// With severity
    #[inline]
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// With status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}
