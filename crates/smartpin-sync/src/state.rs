//! Mutation lifecycle
//!
//! `Pending` is the only non-terminal state; a mutation leaves it exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline-assigned mutation number, unique per pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mut-{}", self.0)
    }
}

/// Lifecycle state of one optimistic mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationState {
    /// Applied locally, commit outstanding
    Pending,
    /// Accepted by the backend, placeholder promoted
    Committed,
    /// Rejected or timed out, local state restored
    RolledBack,
}

impl MutationState {
    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        allowed_transitions(*self).is_empty()
    }
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: MutationState) -> &'static [MutationState] {
    use MutationState::*;
    match from {
        Pending => &[Committed, RolledBack],
        Committed | RolledBack => &[],
    }
}

/// Illegal lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal mutation transition {from:?} -> {to:?}")]
pub struct IllegalMutationTransition {
    /// Current state
    pub from: MutationState,
    /// Requested state
    pub to: MutationState,
}

/// Validates a lifecycle step
pub fn validate_transition(from: MutationState, to: MutationState) -> Result<(), IllegalMutationTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalMutationTransition { from, to })
    }
}
