//! Child issues owned by a marker

use crate::error::ModelError;
use crate::ids::{EntityId, LocalId, PhotoId};
use crate::status::{Severity, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sequential child code `{parentSeq}.{index}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChildCode {
    /// Parent marker's sequence number
    pub parent_seq: u32,
    /// 1-based index under the parent
    pub index: u32,
}

impl ChildCode {
    /// Create code
    #[inline]
    #[must_use]
    pub const fn new(parent_seq: u32, index: u32) -> Self {
        Self { parent_seq, index }
    }
}

impl fmt::Display for ChildCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.parent_seq, self.index)
    }
}

impl FromStr for ChildCode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidChildCode(s.to_string());
        let (seq, index) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            parent_seq: seq.parse().map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

/// Photo purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhotoKind {
    /// Taken when the issue was opened
    Opening,
    /// Evidence of resolution
    Closure,
}

/// Reference to a stored photo
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoRef {
    /// Attachment identity
    pub id: PhotoId,
    /// Purpose
    pub kind: PhotoKind,
}

impl PhotoRef {
    /// Closure photo reference
    #[inline]
    #[must_use]
    pub fn closure(id: impl Into<String>) -> Self {
        Self {
            id: PhotoId::new(id),
            kind: PhotoKind::Closure,
        }
    }

    /// Opening photo reference
    #[inline]
    #[must_use]
    pub fn opening(id: impl Into<String>) -> Self {
        Self {
            id: PhotoId::new(id),
            kind: PhotoKind::Opening,
        }
    }
}

/// Issue record nested under a marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildIssue {
    /// Identity
    pub id: EntityId,
    /// Owning marker (local key)
    pub marker: LocalId,
    /// Code assigned at creation, never reused
    pub code: ChildCode,
    /// Inspection status
    pub status: Status,
    /// Defect severity
    pub severity: Severity,
    /// Attached photos
    pub photos: Vec<PhotoRef>,
    /// When the issue was opened
    pub opened_at: DateTime<Utc>,
    /// When the issue was closed, if closed
    pub closed_at: Option<DateTime<Utc>>,
    /// Server revision, 0 for placeholders
    pub revision: u64,
}

impl ChildIssue {
    /// New open child issue
    #[must_use]
    pub fn new(id: EntityId, marker: LocalId, code: ChildCode) -> Self {
        Self {
            id,
            marker,
            code,
            status: Status::Open,
            severity: Severity::default(),
            photos: Vec::new(),
            opened_at: Utc::now(),
            closed_at: None,
            revision: 0,
        }
    }

    /// Whether any attached photo is closure evidence
    #[inline]
    #[must_use]
    pub fn has_closure_photo(&self) -> bool {
        self.photos.iter().any(|p| p.kind == PhotoKind::Closure)
    }

    /// Set status and keep `closed_at` in step
    pub fn set_status(&mut self, status: Status, at: DateTime<Utc>) {
        self.status = status;
        self.closed_at = match status {
            Status::Closed => Some(self.closed_at.unwrap_or(at)),
            _ => None,
        };
    }
}
