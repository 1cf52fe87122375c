//! Cluster topology and affinity contract.
//!
//! The discovery / affinity-function layer is an external collaborator
//! (spec §1, out of scope): the restore engine only ever *consumes* an
//! ideal partition assignment, it never computes one. This module
//! defines that consumption contract plus a deterministic fake used by
//! tests and by the in-process fixture cluster (C15).

use crate::ids::{GroupId, NodeId, PartitionId};
use std::collections::{BTreeMap, BTreeSet};

/// The subset of cluster discovery state the staging planner needs.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    /// The fixed set of storage-bearing nodes expected to hold durable state.
    pub baseline: BTreeSet<NodeId>,
    /// Nodes currently alive and participating.
    pub alive: BTreeSet<NodeId>,
}

impl ClusterTopology {
    /// Construct a topology where every baseline node is alive.
    pub fn all_alive(baseline: impl IntoIterator<Item = NodeId>) -> Self {
        let baseline: BTreeSet<NodeId> = baseline.into_iter().collect();
        Self {
            alive: baseline.clone(),
            baseline,
        }
    }

    /// The baseline nodes that are currently alive, in deterministic order.
    pub fn alive_baseline(&self) -> Vec<NodeId> {
        self.baseline.intersection(&self.alive).copied().collect()
    }

    /// Mark a node as having left.
    pub fn mark_left(&mut self, node: NodeId) {
        self.alive.remove(&node);
    }

    /// True if `node` is a required (baseline) member.
    pub fn is_required(&self, node: &NodeId) -> bool {
        self.baseline.contains(node)
    }
}

/// Maps a `(group, partition)` to its ideal replica assignment (primary
/// first) under the current topology. Implementations never see
/// *current* ownership, only the ideal one — restoring always targets
/// the ideal assignment, per spec §4.2 step 1.
pub trait AffinityFunction: Send + Sync {
    /// Ideal replica nodes for `(group, partition)`, primary-first.
    /// Empty if the partition is unknown to this function.
    fn ideal_assignment(
        &self,
        group: &GroupId,
        partition: PartitionId,
        topology: &ClusterTopology,
    ) -> Vec<NodeId>;

    /// Resolve the partition a `key` belongs to. Used as the fallback
    /// when a WAL entry doesn't carry an explicit partition id (spec
    /// §4.4): the apply loop warns and routes by key instead of failing.
    fn partition(&self, group: &GroupId, key: &[u8]) -> PartitionId;
}

/// A deterministic affinity function for tests: partitions are assigned
/// round-robin across the alive baseline, with replication factor 1
/// (restore only cares about "is this node in the ideal set", not about
/// replica ordering beyond primary-first, so RF > 1 just widens the set).
#[derive(Debug, Clone)]
pub struct RoundRobinAffinity {
    /// Explicit assignment overrides: `(group, partition) -> nodes`.
    /// Anything not listed here falls back to the round-robin default.
    pub overrides: BTreeMap<(GroupId, PartitionId), Vec<NodeId>>,
    /// Replication factor used by the round-robin default.
    pub replication_factor: usize,
}

impl RoundRobinAffinity {
    /// A round-robin affinity with replication factor 1.
    pub fn new() -> Self {
        Self {
            overrides: BTreeMap::new(),
            replication_factor: 1,
        }
    }

    /// Pin a specific `(group, partition)` to an explicit node list.
    pub fn pin(mut self, group: impl Into<GroupId>, partition: PartitionId, nodes: Vec<NodeId>) -> Self {
        self.overrides.insert((group.into(), partition), nodes);
        self
    }
}

impl Default for RoundRobinAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityFunction for RoundRobinAffinity {
    fn ideal_assignment(
        &self,
        group: &GroupId,
        partition: PartitionId,
        topology: &ClusterTopology,
    ) -> Vec<NodeId> {
        if let Some(nodes) = self.overrides.get(&(group.clone(), partition)) {
            return nodes.clone();
        }
        let alive = topology.alive_baseline();
        if alive.is_empty() {
            return Vec::new();
        }
        let start = (partition as usize) % alive.len();
        (0..self.replication_factor.min(alive.len()))
            .map(|offset| alive[(start + offset) % alive.len()])
            .collect()
    }

    fn partition(&self, group: &GroupId, key: &[u8]) -> PartitionId {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(group.0.as_bytes());
        hasher.update(key);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_baseline_excludes_departed_nodes() {
        let a = NodeId::new();
        let b = NodeId::new();
        let mut topo = ClusterTopology::all_alive([a, b]);
        topo.mark_left(b);
        assert_eq!(topo.alive_baseline(), vec![a]);
    }

    #[test]
    fn round_robin_distributes_partitions_across_nodes() {
        let a = NodeId::new();
        let b = NodeId::new();
        let topo = ClusterTopology::all_alive([a, b]);
        let affinity = RoundRobinAffinity::new();
        let group: GroupId = "orders".into();

        let p0 = affinity.ideal_assignment(&group, 0, &topo);
        let p1 = affinity.ideal_assignment(&group, 1, &topo);
        assert_eq!(p0.len(), 1);
        assert_eq!(p1.len(), 1);
        assert_ne!(p0, p1);
    }

    #[test]
    fn pinned_override_takes_precedence() {
        let a = NodeId::new();
        let b = NodeId::new();
        let topo = ClusterTopology::all_alive([a, b]);
        let group: GroupId = "orders".into();
        let affinity = RoundRobinAffinity::new().pin(group.clone(), 0, vec![a, b]);

        assert_eq!(affinity.ideal_assignment(&group, 0, &topo), vec![a, b]);
    }

    #[test]
    fn partition_for_key_is_deterministic_and_group_scoped() {
        let affinity = RoundRobinAffinity::new();
        let orders: GroupId = "orders".into();
        let users: GroupId = "users".into();

        assert_eq!(affinity.partition(&orders, b"key-1"), affinity.partition(&orders, b"key-1"));
        assert_ne!(affinity.partition(&orders, b"key-1"), affinity.partition(&users, b"key-1"));
    }
}
