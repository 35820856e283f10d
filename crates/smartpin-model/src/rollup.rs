//! Parent-level status rollups
//!
//! A marker's rollup is always derived from the live set of its child
//! issues. [`recompute`] is total and idempotent: calling it again on the
//! same children yields the same value.

use crate::child::ChildIssue;
use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Summary flag over a marker's children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MixedState {
    /// No children
    #[default]
    Empty,
    /// Some open, none closed
    Open,
    /// All unresolved children are ready, none open or closed
    Ready,
    /// Every child is closed
    AllClosed,
    /// Unresolved and closed children coexist
    Mixed,
}

/// Child counts partitioned by status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rollup {
    /// Number of children
    pub total: u32,
    /// Children in `Open`
    pub open: u32,
    /// Children in `ReadyForInspection`
    pub ready: u32,
    /// Children in `Closed`
    pub closed: u32,
    /// Summary flag
    pub mixed_state: MixedState,
}

impl Rollup {
    /// Rollup over a sequence of child statuses
    #[must_use]
    pub fn from_statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
        let mut rollup = Self::default();
        for status in statuses {
            match status {
                Status::Open => rollup.open += 1,
                Status::ReadyForInspection => rollup.ready += 1,
                Status::Closed => rollup.closed += 1,
            }
        }
        rollup.total = rollup.open + rollup.ready + rollup.closed;
        rollup.mixed_state = classify(rollup.open, rollup.ready, rollup.closed);
        rollup
    }

    /// Check counts and flag agree with each other
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total == self.open + self.ready + self.closed
            && self.mixed_state == classify(self.open, self.ready, self.closed)
    }
}

/// Recompute a marker's rollup from its current children
#[must_use]
pub fn recompute<'a>(children: impl IntoIterator<Item = &'a ChildIssue>) -> Rollup {
    Rollup::from_statuses(children.into_iter().map(|c| c.status))
}

fn classify(open: u32, ready: u32, closed: u32) -> MixedState {
    let unresolved = open + ready;
    match (unresolved, closed) {
        (0, 0) => MixedState::Empty,
        (0, _) => MixedState::AllClosed,
        (_, 0) if open > 0 => MixedState::Open,
        (_, 0) => MixedState::Ready,
        _ => MixedState::Mixed,
    }
}
