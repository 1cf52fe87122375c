//! Stable identifiers used throughout the restore engine.
//!
//! Mirrors the newtype-over-`Uuid` convention used elsewhere in the
//! workspace (`crates/core/src/types.rs`'s `BranchId(Uuid)`): a thin
//! wrapper so the type system keeps node ids, request ids, and
//! group/cache ids from being mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID (e.g. one received over the wire).
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(RequestId);
uuid_newtype!(NodeId);

/// A cache group identifier. Cache groups are named; the id is the name
/// itself (group names are already globally unique within a cluster, so
/// no surrogate key is needed).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        GroupId(s.to_string())
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        GroupId(s)
    }
}

/// A cache identifier, derived from the cache name. Ungrouped caches use
/// the same id for both their cache id and their group id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheId(pub String);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheId {
    fn from(s: &str) -> Self {
        CacheId(s.to_string())
    }
}

/// A partition id within a cache group.
pub type PartitionId = u32;

/// Reserved partition id for a group's secondary-index pages.
pub const INDEX_PARTITION: PartitionId = u32::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn node_id_roundtrips_through_uuid() {
        let id = NodeId::new();
        let raw = id.as_uuid();
        assert_eq!(NodeId::from_uuid(raw), id);
    }

    #[test]
    fn group_id_display() {
        let g: GroupId = "orders".into();
        assert_eq!(g.to_string(), "orders");
    }
}
