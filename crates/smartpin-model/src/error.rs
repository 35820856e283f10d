//! Error types for the data model

use crate::status::Status;

/// Model-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Status change not allowed by the state machine
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        /// Current status
        from: Status,
        /// Requested status
        to: Status,
    },

    /// Child code not in `{parentSeq}.{index}` form
    #[error("invalid child code: {0}")]
    InvalidChildCode(String),
}
