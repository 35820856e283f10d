//! Drawing layers

use crate::ids::LayerId;
use serde::{Deserialize, Serialize};

/// Role name granted write access to a layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub String);

impl Role {
    /// Create role
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Layer markers and annotations are drawn on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Identity
    pub id: LayerId,
    /// Display name
    pub name: String,
    /// Hidden layers take no part in hit-testing or rendering
    pub visible: bool,
    /// Render opacity in `[0, 1]`
    pub opacity: f32,
    /// Locked layers reject mutations
    pub locked: bool,
    /// Stacking order, higher draws on top
    pub order: i32,
    /// Roles allowed to write; empty means everyone
    pub write_roles: Vec<Role>,
    /// Server revision
    pub revision: u64,
}

impl Layer {
    /// Visible, unlocked layer writable by everyone
    #[must_use]
    pub fn new(id: impl Into<LayerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            visible: true,
            opacity: 1.0,
            locked: false,
            order: 0,
            write_roles: Vec::new(),
            revision: 0,
        }
    }

    /// Whether `role` may write to this layer (ignores the lock)
    #[inline]
    #[must_use]
    pub fn permits(&self, role: &Role) -> bool {
        self.write_roles.is_empty() || self.write_roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_write_roles_permit_everyone() {
        let layer = Layer::new("base", "Base");
        assert!(layer.permits(&Role::new("inspector")));
    }

    #[test]
    fn write_roles_restrict() {
        let mut layer = Layer::new("qa", "QA");
        layer.write_roles.push(Role::new("qa_manager"));
        assert!(layer.permits(&Role::new("qa_manager")));
        assert!(!layer.permits(&Role::new("installer")));
    }
}
