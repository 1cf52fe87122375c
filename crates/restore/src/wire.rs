//! Wire records exchanged between nodes during the distributed phase
//! protocol (C9).
//!
//! Value types with stable field ordering, serialized via the same
//! msgpack codec the rest of the workspace uses for on-wire/on-disk
//! structures (`rmp-serde`), so they compose with whatever real
//! transport an integrator plugs into `ClusterTransport`.

use crate::cache_config::CacheConfig;
use crate::ids::{GroupId, NodeId, RequestId};
use crate::metadata::SnapshotMetadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// The request that kicks off a restore attempt, broadcast to every
/// required node at Prepare time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Unique id for this attempt.
    pub request_id: RequestId,
    /// The node that originated the request.
    pub originator: NodeId,
    /// Name of the snapshot to restore.
    pub snapshot_name: String,
    /// Optional override of the snapshot root path.
    pub snapshot_path: Option<PathBuf>,
    /// Groups to restore; `None` means "all groups in the snapshot".
    pub groups: Option<BTreeSet<GroupId>>,
    /// The baseline node set at submission time.
    pub baseline: BTreeSet<NodeId>,
    /// 0 means "no incremental chain", otherwise the 1-based chain length.
    pub incremental_index: u32,
    /// Authoritative `onlyPrimary` flag, chosen from the first metadata
    /// collected during snapshot verification.
    pub only_primary: bool,
}

impl OperationRequest {
    /// Encode to the wire byte format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Decode from the wire byte format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }
}

/// A node's reply to the Prepare phase: what it already knows locally
/// about the caches being restored, plus its own snapshot metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// The node replying.
    pub node_id: NodeId,
    /// Cache configs this node knows locally for the requested groups.
    pub cache_configs: Vec<CacheConfig>,
    /// This node's local snapshot metadata (normally exactly one entry;
    /// a `Vec` because a node can hold metadata for more than one
    /// consistent-id folder in edge cases like a restarted baseline slot).
    pub metadata: Vec<SnapshotMetadata>,
}

impl PrepareResponse {
    /// Encode to the wire byte format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Decode from the wire byte format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }
}
