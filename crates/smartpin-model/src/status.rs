//! Inspection status and its transition rules

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inspection status shared by markers and child issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Defect reported, work outstanding
    Open,
    /// Work done, awaiting inspection
    ReadyForInspection,
    /// Inspected and closed
    Closed,
}

impl Status {
    /// All statuses in lifecycle order
    pub const ALL: [Status; 3] = [Status::Open, Status::ReadyForInspection, Status::Closed];

    /// Stable wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "Open",
            Status::ReadyForInspection => "ReadyForInspection",
            Status::Closed => "Closed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defect severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    /// Cosmetic
    Low,
    /// Needs attention
    #[default]
    Medium,
    /// Needs prompt attention
    High,
    /// Blocks handover
    Critical,
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Status) -> &'static [Status] {
    use Status::*;
    match from {
        Open => &[ReadyForInspection, Closed],
        ReadyForInspection => &[Open, Closed],
        Closed => &[Open],
    }
}

/// Validates a status transition
pub fn validate_transition(from: Status, to: Status) -> Result<(), ModelError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ModelError::IllegalTransition { from, to })
    }
}
