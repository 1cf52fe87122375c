//! Cache configuration payload (opaque to the restore engine).
//!
//! The engine never interprets a cache's configuration — it only stores
//! it, ships it between nodes during Prepare, and hands it back to the
//! cache subsystem at `CacheStart`. The cache-configuration store itself
//! is an external collaborator (see spec §1, out of scope).

use crate::ids::{CacheId, GroupId};
use serde::{Deserialize, Serialize};

/// Opaque cache configuration, identified by a stable cache id derived
/// from the cache's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Stable id derived from the cache name.
    pub cache_id: CacheId,
    /// Human-readable cache name.
    pub name: String,
    /// The group this cache belongs to. Equal to `cache_id` (wrapped)
    /// for ungrouped caches.
    pub group_id: GroupId,
    /// Opaque serialized configuration payload, owned entirely by the
    /// cache subsystem. The engine never looks inside this.
    pub payload: Vec<u8>,
}

impl CacheConfig {
    /// Create a new ungrouped cache config: its group id equals its name.
    pub fn ungrouped(name: impl Into<String>, payload: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            cache_id: CacheId(name.clone()),
            group_id: GroupId(name.clone()),
            name,
            payload,
        }
    }

    /// Create a new cache config that belongs to an explicit group.
    pub fn grouped(name: impl Into<String>, group: impl Into<String>, payload: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            cache_id: CacheId(name.clone()),
            group_id: GroupId(group.into()),
            name,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ungrouped_cache_uses_name_as_group() {
        let cfg = CacheConfig::ungrouped("orders", vec![1, 2, 3]);
        assert_eq!(cfg.group_id.0, "orders");
        assert_eq!(cfg.cache_id.0, "orders");
    }

    #[test]
    fn grouped_cache_keeps_distinct_group() {
        let cfg = CacheConfig::grouped("orders-eu", "orders", vec![]);
        assert_eq!(cfg.cache_id.0, "orders-eu");
        assert_eq!(cfg.group_id.0, "orders");
    }
}
