//! Contracts with the persistence backend and the push channel
//!
//! Both are opaque async services. Commit requests reference other entities
//! by [`RemoteId`] only; the pipeline resolves local keys before sending.

use crate::error::{ChannelError, CommitFailure};
use crate::intent::{ChildChanges, MarkerChanges};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smartpin_geometry::NormalizedPoint;
use smartpin_model::{
    ChangeEvent, ChildIssue, LayerId, LocalId, PhotoRef, Record, RecordKey, RemoteId, ScopeId, ScopeRecords,
    Severity, Status, UserId,
};

/// Remote form of a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommitOp {
    /// Insert a marker; the server assigns id, sequence number and timestamps
    CreateMarker {
        /// Layer
        layer: LayerId,
        /// Normalized position
        position: NormalizedPoint,
        /// Severity
        severity: Severity,
    },
    /// Insert a child issue; the server assigns id and code
    CreateChild {
        /// Parent marker
        marker: RemoteId,
        /// Severity
        severity: Severity,
        /// Photos
        photos: Vec<PhotoRef>,
    },
    /// Change marker fields
    UpdateMarker {
        /// Target
        id: RemoteId,
        /// Changes
        changes: MarkerChanges,
    },
    /// Change child fields
    UpdateChild {
        /// Target
        id: RemoteId,
        /// Changes
        changes: ChildChanges,
    },
    /// Status change
    Transition {
        /// Target
        key: RecordKey,
        /// Requested status
        to: Status,
    },
    /// Remove a row
    Delete {
        /// Target
        key: RecordKey,
    },
}

/// One commit with the local key of the entity it concerns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Local key, echoed on created records as `client_ref`
    pub client_ref: LocalId,
    /// Operation
    pub op: CommitOp,
}

/// Authoritative result of one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommitAck {
    /// Row as stored
    Stored(Record),
    /// Row removed
    Deleted(RecordKey),
}

/// Persistence backend
#[async_trait]
pub trait CommitBackend: Send + Sync {
    /// Commit one mutation
    async fn commit(&self, scope: &ScopeId, request: CommitRequest) -> Result<CommitAck, CommitFailure>;

    /// Commit several mutations as one all-or-nothing operation
    ///
    /// Acks are returned in request order.
    async fn commit_batch(
        &self,
        scope: &ScopeId,
        requests: Vec<CommitRequest>,
    ) -> Result<Vec<CommitAck>, CommitFailure>;
}

/// Ephemeral, never-persisted broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// Cursor moved
    Cursor {
        /// Sender
        user: UserId,
        /// Cursor position
        at: NormalizedPoint,
        /// Active tool
        tool: Option<String>,
    },
    /// In-progress drawing
    DrawingPreview {
        /// Sender
        user: UserId,
        /// Stroke so far
        points: Vec<NormalizedPoint>,
    },
    /// Heartbeat or join
    Presence {
        /// Sender
        user: UserId,
        /// Active tool
        tool: Option<String>,
    },
    /// Explicit leave
    Leave {
        /// Sender
        user: UserId,
    },
}

impl BroadcastEvent {
    /// Sender of the event
    #[must_use]
    pub fn user(&self) -> &UserId {
        match self {
            BroadcastEvent::Cursor { user, .. }
            | BroadcastEvent::DrawingPreview { user, .. }
            | BroadcastEvent::Presence { user, .. }
            | BroadcastEvent::Leave { user } => user,
        }
    }
}

/// Transport-level notice on the push stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Connection dropped
    Disconnected,
    /// Transport error
    Error(String),
}

/// One item delivered by the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Durable change
    Change(ChangeEvent),
    /// Ephemeral broadcast
    Broadcast(BroadcastEvent),
    /// Transport notice
    Status(ChannelStatus),
}

/// Push channel with full-fetch support
///
/// Delivery is at-least-once and unordered across identities, with no gap
/// detection.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Full contents of a scope
    async fn fetch_scope(&self, scope: &ScopeId) -> Result<ScopeRecords, ChannelError>;

    /// Stream of changes and broadcasts for a scope
    async fn subscribe(&self, scope: &ScopeId) -> Result<BoxStream<'static, ChannelMessage>, ChannelError>;

    /// Send an ephemeral broadcast to the scope's other subscribers
    async fn publish(&self, scope: &ScopeId, event: BroadcastEvent) -> Result<(), ChannelError>;
}

/// Photo subsystem contract consulted before closing a child issue
pub trait ClosureEvidence: Send + Sync {
    /// Whether the child issue has a closure photo
    fn has_closure_photo(&self, child: &ChildIssue) -> bool;
}

/// Evidence taken from the photo references attached to the child itself
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachedPhotos;

impl ClosureEvidence for AttachedPhotos {
    fn has_closure_photo(&self, child: &ChildIssue) -> bool {
        child.has_closure_photo()
    }
}
