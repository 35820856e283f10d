//! Wire records exchanged with the backend and push channel
//!
//! Records reference each other by [`RemoteId`] only. `client_ref` echoes
//! the local id of the placeholder that produced the record, letting a
//! client recognise the echo of its own write.

use crate::child::{ChildCode, ChildIssue, PhotoRef};
use crate::ids::{EntityId, LayerId, LocalId, RemoteId, ScopeId};
use crate::layer::Layer;
use crate::marker::Marker;
use crate::rollup::Rollup;
use crate::status::{Severity, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smartpin_geometry::NormalizedPoint;

/// Persisted marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    /// Server identity
    pub id: RemoteId,
    /// Originating placeholder, if created optimistically
    #[serde(default)]
    pub client_ref: Option<LocalId>,
    /// Owning scope
    pub scope: ScopeId,
    /// Layer
    pub layer: LayerId,
    /// Normalized position
    pub position: NormalizedPoint,
    /// Status
    pub status: Status,
    /// Severity
    pub severity: Severity,
    /// Scope sequence number
    pub seq: u32,
    /// Child index counter
    pub next_child_index: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last activity
    pub last_activity_at: DateTime<Utc>,
    /// Server revision
    pub revision: u64,
}

impl MarkerRecord {
    /// Cache form under the given local key; rollup is left for recomputation
    #[must_use]
    pub fn into_marker(self, local: LocalId) -> Marker {
        Marker {
            id: EntityId::authoritative(local, self.id),
            scope: self.scope,
            layer: self.layer,
            position: self.position,
            status: self.status,
            severity: self.severity,
            seq: self.seq,
            next_child_index: self.next_child_index,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            revision: self.revision,
            rollup: Rollup::default(),
        }
    }
}

/// Persisted child issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    /// Server identity
    pub id: RemoteId,
    /// Originating placeholder, if created optimistically
    #[serde(default)]
    pub client_ref: Option<LocalId>,
    /// Owning marker
    pub marker: RemoteId,
    /// Sequential code
    pub code: ChildCode,
    /// Status
    pub status: Status,
    /// Severity
    pub severity: Severity,
    /// Photos
    pub photos: Vec<PhotoRef>,
    /// Open time
    pub opened_at: DateTime<Utc>,
    /// Close time
    pub closed_at: Option<DateTime<Utc>>,
    /// Server revision
    pub revision: u64,
}

impl ChildRecord {
    /// Cache form under the given local keys
    #[must_use]
    pub fn into_child(self, local: LocalId, marker: LocalId) -> ChildIssue {
        ChildIssue {
            id: EntityId::authoritative(local, self.id),
            marker,
            code: self.code,
            status: self.status,
            severity: self.severity,
            photos: self.photos,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            revision: self.revision,
        }
    }
}

/// Any persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum Record {
    /// Marker row
    Marker(MarkerRecord),
    /// Child issue row
    Child(ChildRecord),
    /// Layer row
    Layer(Layer),
}

impl Record {
    /// Key of this record
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Marker(m) => RecordKey::Marker(m.id.clone()),
            Record::Child(c) => RecordKey::Child(c.id.clone()),
            Record::Layer(l) => RecordKey::Layer(l.id.clone()),
        }
    }

    /// Originating placeholder, if any
    #[must_use]
    pub fn client_ref(&self) -> Option<LocalId> {
        match self {
            Record::Marker(m) => m.client_ref,
            Record::Child(c) => c.client_ref,
            Record::Layer(_) => None,
        }
    }

    /// Server revision
    #[must_use]
    pub fn revision(&self) -> u64 {
        match self {
            Record::Marker(m) => m.revision,
            Record::Child(c) => c.revision,
            Record::Layer(l) => l.revision,
        }
    }
}

/// Server-side key of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "table", content = "id", rename_all = "snake_case")]
pub enum RecordKey {
    /// Marker row
    Marker(RemoteId),
    /// Child issue row
    Child(RemoteId),
    /// Layer row
    Layer(LayerId),
}

/// Durable change delivered by the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// Row inserted
    Insert {
        /// New row
        record: Record,
    },
    /// Row updated
    Update {
        /// Updated row
        record: Record,
    },
    /// Row deleted
    Delete {
        /// Deleted row key
        key: RecordKey,
    },
}

impl ChangeEvent {
    /// Key of the affected record
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => record.key(),
            ChangeEvent::Delete { key } => key.clone(),
        }
    }
}

/// Full contents of one scope, used to seed and resync the cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeRecords {
    /// Markers
    pub markers: Vec<MarkerRecord>,
    /// Child issues
    pub children: Vec<ChildRecord>,
    /// Layers
    pub layers: Vec<Layer>,
}
