//! Closed set of cached entity kinds

use crate::child::ChildIssue;
use crate::ids::{EntityId, LayerId, LocalId};
use crate::layer::Layer;
use crate::marker::Marker;
use serde::{Deserialize, Serialize};

/// Any entity held in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    /// Top-level pin
    Marker(Marker),
    /// Issue under a pin
    Child(ChildIssue),
    /// Drawing layer
    Layer(Layer),
}

impl Entity {
    /// Key addressing this entity in the cache
    #[must_use]
    pub fn key(&self) -> EntityRef {
        match self {
            Entity::Marker(m) => EntityRef::Marker(m.id.local),
            Entity::Child(c) => EntityRef::Child(c.id.local),
            Entity::Layer(l) => EntityRef::Layer(l.id.clone()),
        }
    }

    /// Two-field identity for markers and children
    #[must_use]
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            Entity::Marker(m) => Some(&m.id),
            Entity::Child(c) => Some(&c.id),
            Entity::Layer(_) => None,
        }
    }

    /// Server revision
    #[must_use]
    pub fn revision(&self) -> u64 {
        match self {
            Entity::Marker(m) => m.revision,
            Entity::Child(c) => c.revision,
            Entity::Layer(l) => l.revision,
        }
    }
}

/// Cache key of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// Marker by local id
    Marker(LocalId),
    /// Child by local id
    Child(LocalId),
    /// Layer by id
    Layer(LayerId),
}

impl EntityRef {
    /// Local id for markers and children
    #[must_use]
    pub fn local(&self) -> Option<LocalId> {
        match self {
            EntityRef::Marker(id) | EntityRef::Child(id) => Some(*id),
            EntityRef::Layer(_) => None,
        }
    }
}
