//! Mutation intents
//!
//! A closed set of variants dispatched through one planning match, so every
//! kind of write is handled exhaustively.

use serde::{Deserialize, Serialize};
use smartpin_geometry::NormalizedPoint;
use smartpin_model::{EntityRef, LayerId, LocalId, PhotoRef, Role, Severity, Status, UserId};

/// Who is mutating
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// User identity
    pub user: UserId,
    /// Role checked against layer write lists
    pub role: Role,
}

impl Actor {
    /// Create actor
    #[inline]
    #[must_use]
    pub fn new(user: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user: UserId::new(user),
            role: Role::new(role),
        }
    }
}

/// New marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerDraft {
    /// Layer to draw on
    pub layer: LayerId,
    /// Normalized position
    pub position: NormalizedPoint,
    /// Severity
    pub severity: Severity,
}

/// New child issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildDraft {
    /// Parent marker (local key)
    pub marker: LocalId,
    /// Severity
    pub severity: Severity,
    /// Photos attached at creation
    pub photos: Vec<PhotoRef>,
}

/// Field changes for a marker; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerChanges {
    /// Move to
    pub position: Option<NormalizedPoint>,
    /// Change severity
    pub severity: Option<Severity>,
    /// Move to another layer
    pub layer: Option<LayerId>,
}

impl MarkerChanges {
    /// Only a move
    #[must_use]
    pub fn moved_to(position: NormalizedPoint) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }
}

/// Field changes for a child issue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildChanges {
    /// Change severity
    pub severity: Option<Severity>,
    /// Photos to append
    pub add_photos: Vec<PhotoRef>,
}

/// What to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Draft {
    /// Marker
    Marker(MarkerDraft),
    /// Child issue
    Child(ChildDraft),
}

/// What to change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Edit {
    /// Marker fields
    Marker {
        /// Target
        id: LocalId,
        /// Changes
        changes: MarkerChanges,
    },
    /// Child issue fields
    Child {
        /// Target
        id: LocalId,
        /// Changes
        changes: ChildChanges,
    },
}

/// Existing marker or child issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Marker
    Marker(LocalId),
    /// Child issue
    Child(LocalId),
}

impl Target {
    /// Cache key
    #[inline]
    #[must_use]
    pub fn key(&self) -> EntityRef {
        match self {
            Target::Marker(id) => EntityRef::Marker(*id),
            Target::Child(id) => EntityRef::Child(*id),
        }
    }
}

/// Mutation request against a marker or child issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    /// Create a new entity under a placeholder identity
    Create(Draft),
    /// Change fields
    Update(Edit),
    /// Remove; removing a marker removes its children
    Delete(Target),
    /// Move through the status lifecycle
    StatusTransition {
        /// Entity
        target: Target,
        /// Requested status
        to: Status,
    },
}

impl Intent {
    /// Create a marker
    #[must_use]
    pub fn create_marker(layer: impl Into<LayerId>, position: NormalizedPoint) -> Self {
        Self::Create(Draft::Marker(MarkerDraft {
            layer: layer.into(),
            position,
            severity: Severity::default(),
        }))
    }

    /// Create a child issue under `marker`
    #[must_use]
    pub fn create_child(marker: LocalId, photos: Vec<PhotoRef>) -> Self {
        Self::Create(Draft::Child(ChildDraft {
            marker,
            severity: Severity::default(),
            photos,
        }))
    }

    /// Short label for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Create(Draft::Marker(_)) => "create_marker",
            Intent::Create(Draft::Child(_)) => "create_child",
            Intent::Update(Edit::Marker { .. }) => "update_marker",
            Intent::Update(Edit::Child { .. }) => "update_child",
            Intent::Delete(_) => "delete",
            Intent::StatusTransition { .. } => "transition",
        }
    }
}

/// One `{id, update}` item of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchItem {
    /// Field changes
    Update(Edit),
    /// Status change
    Transition {
        /// Entity
        target: Target,
        /// Requested status
        to: Status,
    },
}

impl From<BatchItem> for Intent {
    fn from(item: BatchItem) -> Self {
        match item {
            BatchItem::Update(edit) => Intent::Update(edit),
            BatchItem::Transition { target, to } => Intent::StatusTransition { target, to },
        }
    }
}
