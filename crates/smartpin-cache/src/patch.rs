//! Structural patches applied to a scope snapshot

use smartpin_model::{Entity, EntityRef, LocalId, Rollup};

/// One structural change to a scope snapshot
///
/// `Update`, `Delete`, `Promote` and `SetRollup` are no-ops when the target
/// is absent, so replaying a patch is harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Insert or overwrite
    Insert(Entity),
    /// Overwrite an existing entity
    Update(Entity),
    /// Remove an entity; removing a marker also removes its children
    Delete(EntityRef),
    /// Swap a placeholder for its authoritative version in place
    ///
    /// The entity keeps its local key and gains its remote id; the alias
    /// index is updated in the same step.
    Promote(Entity),
    /// Replace a marker's derived child counts
    SetRollup {
        /// Marker local key
        marker: LocalId,
        /// New rollup
        rollup: Rollup,
    },
}

impl Patch {
    /// Key of the patched entity
    #[must_use]
    pub fn target(&self) -> EntityRef {
        match self {
            Patch::Insert(e) | Patch::Update(e) | Patch::Promote(e) => e.key(),
            Patch::Delete(key) => key.clone(),
            Patch::SetRollup { marker, .. } => EntityRef::Marker(*marker),
        }
    }

    /// Patch restoring `prior` at `key`: re-insert if it existed, delete otherwise
    #[must_use]
    pub fn restore(key: EntityRef, prior: Option<Entity>) -> Self {
        match prior {
            Some(entity) => Patch::Insert(entity),
            None => Patch::Delete(key),
        }
    }
}
