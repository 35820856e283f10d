//! Error types for the sync layer
//!
//! - [`ValidationFailure`]: precondition not met, reported before any local change
//! - [`SyncError`]: everything a mutation or subscription can surface to its caller
//! - [`CommitFailure`] / [`ChannelError`]: what the backend contracts return

use smartpin_model::{LayerId, LocalId, Role, Status};

/// Mutation precondition that did not hold
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationFailure {
    /// Closing a child issue requires a closure photo
    #[error("child issue {0} has no closure photo")]
    MissingClosurePhoto(LocalId),

    /// Target entity is not in the cache
    #[error("entity {0} not found")]
    UnknownEntity(LocalId),

    /// Parent marker is not in the cache
    #[error("marker {0} not found")]
    UnknownMarker(LocalId),

    /// Referenced layer is not in the cache
    #[error("layer {0} not found")]
    UnknownLayer(LayerId),

    /// Status change not allowed by the lifecycle
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        /// Current status
        from: Status,
        /// Requested status
        to: Status,
    },

    /// Layer is locked
    #[error("layer {0} is locked")]
    LayerLocked(LayerId),

    /// Actor's role may not write to the layer
    #[error("role {role:?} may not write to layer {layer}")]
    WriteNotPermitted {
        /// Layer
        layer: LayerId,
        /// Actor role
        role: Role,
    },

    /// Position outside `[0, 1]²` or not finite
    #[error("position ({x}, {y}) outside the content extent")]
    PositionOutOfRange {
        /// Horizontal fraction
        x: f64,
        /// Vertical fraction
        y: f64,
    },

    /// Batch with no items
    #[error("batch is empty")]
    EmptyBatch,
}

/// Remote backend refused a commit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct CommitFailure {
    /// Human-readable cause
    pub reason: String,
}

impl CommitFailure {
    /// Create failure
    #[inline]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Push channel transport error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Backend could not be reached
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// Channel was closed by the backend
    #[error("channel closed")]
    Closed,
}

/// Main sync error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Precondition failed, nothing was applied
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    /// Backend refused the mutation, local state rolled back
    #[error("commit rejected: {reason}")]
    CommitRejected {
        /// Backend-supplied cause
        reason: String,
    },

    /// No commit response before the deadline, local state rolled back
    #[error("commit timed out after {after_ms}ms")]
    NetworkTimeout {
        /// Deadline that elapsed
        after_ms: u64,
    },

    /// Realtime subscription is not live
    #[error("realtime channel degraded")]
    ChannelDegraded,

    /// Channel transport error
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl SyncError {
    /// Check if the caller may reasonably retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTimeout { .. })
    }

    /// Check if optimistic local state was rolled back
    #[inline]
    #[must_use]
    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::CommitRejected { .. } | Self::NetworkTimeout { .. })
    }

    /// Validation failure, if that is what this is
    #[inline]
    #[must_use]
    pub fn validation(&self) -> Option<&ValidationFailure> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<CommitFailure> for SyncError {
    fn from(failure: CommitFailure) -> Self {
        Self::CommitRejected {
            reason: failure.reason,
        }
    }
}
