//! Identity types
//!
//! Entities carry a two-field identity: a client-minted [`LocalId`] that is
//! stable for the entity's lifetime in the cache, and an optional
//! server-assigned [`RemoteId`]. An entity without a remote id is a
//! placeholder created by an optimistic mutation.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Display prefix for placeholder identities
pub const PLACEHOLDER_PREFIX: &str = "tmp-";

/// Client-side identity (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(pub Ulid);

impl LocalId {
    /// Generate new local ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string identifier
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow as str
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned identity
    RemoteId
);
string_id!(
    /// Collaboration scope (one structure/roof)
    ScopeId
);
string_id!(
    /// Layer identity
    LayerId
);
string_id!(
    /// User identity
    UserId
);
string_id!(
    /// Photo attachment identity
    PhotoId
);

/// Local identity plus the authoritative identity once known
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    /// Stable client-side key
    pub local: LocalId,
    /// Server identity, `None` while the entity is a placeholder
    pub remote: Option<RemoteId>,
}

impl EntityId {
    /// Fresh placeholder identity
    #[inline]
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            local: LocalId::new(),
            remote: None,
        }
    }

    /// Identity with both halves known
    #[inline]
    #[must_use]
    pub fn authoritative(local: LocalId, remote: RemoteId) -> Self {
        Self {
            local,
            remote: Some(remote),
        }
    }

    /// Whether the server has not yet assigned an identity
    #[inline]
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.remote.is_none()
    }

    /// Same local identity carrying the given remote identity
    #[inline]
    #[must_use]
    pub fn promoted(&self, remote: RemoteId) -> Self {
        Self::authoritative(self.local, remote)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote {
            Some(remote) => write!(f, "{remote}"),
            None => write!(f, "{PLACEHOLDER_PREFIX}{}", self.local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_display_is_prefixed() {
        let id = EntityId::placeholder();
        assert!(id.is_placeholder());
        assert!(id.to_string().starts_with(PLACEHOLDER_PREFIX));
    }

    #[test]
    fn promotion_keeps_local_identity() {
        let id = EntityId::placeholder();
        let promoted = id.promoted(RemoteId::new("m-17"));
        assert_eq!(promoted.local, id.local);
        assert!(!promoted.is_placeholder());
        assert_eq!(promoted.to_string(), "m-17");
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let json = serde_json::to_string(&ScopeId::new("roof-1")).unwrap();
        assert_eq!(json, "\"roof-1\"");
    }
}
