//! Cluster transport contract (C11).
//!
//! Node-to-node messaging is an external collaborator (spec §1): the
//! engine never opens a socket itself, it only calls through this
//! trait. A real integrator plugs in whatever RPC layer the cluster
//! already uses; tests and the in-process fixture cluster (C15) use
//! `LoopbackTransport` below, which dispatches directly into sibling
//! `RestoreContext`s in the same process.

use crate::error::{RestoreError, Result};
use crate::ids::{GroupId, NodeId, PartitionId};
use crate::wire::{OperationRequest, PrepareResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Phase-completion signal exchanged once every node has finished its
/// local slice of a phase, so the coordinator knows when to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSignal {
    /// This node finished its local Prepare-phase work.
    PrepareDone,
    /// This node finished staging every partition it owns.
    PreloadDone,
    /// This node finished starting its local caches.
    CacheStartDone,
    /// This node finished replaying its slice of the incremental chain.
    IncrementalApplyDone,
    /// This node finished stopping the caches it had already started, as
    /// part of rolling back a failed attempt.
    CacheStopDone,
    /// This node finished undoing its local partial work.
    RollbackDone,
}

/// Node-to-node messaging the restore engine depends on but never
/// implements. Every method is scoped to one `(from, to)` hop; fan-out
/// to multiple peers is the caller's responsibility.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Send a Prepare request to `to` and await its response.
    async fn send_prepare(&self, to: NodeId, request: OperationRequest) -> Result<PrepareResponse>;

    /// Tell `to` that the local node finished a phase.
    async fn send_phase_signal(&self, to: NodeId, request_id: crate::ids::RequestId, signal: PhaseSignal) -> Result<()>;

    /// Fetch one partition file from `from`, writing its bytes to `dest`.
    /// Implementations own the streaming and retry policy; a single
    /// failed fetch should surface as `RestoreError::RemoteFetch`.
    async fn fetch_partition(
        &self,
        from: NodeId,
        group: &GroupId,
        partition: PartitionId,
        dest: &Path,
    ) -> Result<()>;
}

/// Per-node inbox used by `LoopbackTransport`: whatever a real RPC layer
/// would deliver to a handler, delivered here as a direct call instead.
#[async_trait]
pub trait LoopbackNode: Send + Sync {
    /// Handle an incoming Prepare request locally.
    async fn handle_prepare(&self, request: OperationRequest) -> Result<PrepareResponse>;

    /// Handle an incoming phase-completion signal locally.
    async fn handle_phase_signal(&self, request_id: crate::ids::RequestId, signal: PhaseSignal) -> Result<()>;

    /// Serve a partition file from this node's local staging area.
    async fn serve_partition(&self, group: &GroupId, partition: PartitionId) -> Result<Vec<u8>>;
}

/// An in-process `ClusterTransport` that dispatches directly into the
/// `LoopbackNode` registered for each target, instead of going over a
/// socket. Used by the in-process fixture cluster (C15) and by any test
/// that needs more than one cooperating `RestoreContext`.
#[derive(Default, Clone)]
pub struct LoopbackTransport {
    nodes: Arc<DashMap<NodeId, Arc<dyn LoopbackNode>>>,
}

impl LoopbackTransport {
    /// An empty loopback transport with no registered peers.
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
        }
    }

    /// Register (or replace) the handler for `node`.
    pub fn register(&self, node: NodeId, handler: Arc<dyn LoopbackNode>) {
        self.nodes.insert(node, handler);
    }

    /// Deregister `node`, simulating it leaving the cluster at the
    /// transport level (future sends to it fail as `Transport` errors).
    pub fn unregister(&self, node: &NodeId) {
        self.nodes.remove(node);
    }

    fn lookup(&self, node: NodeId) -> Result<Arc<dyn LoopbackNode>> {
        self.nodes.get(&node).map(|e| Arc::clone(e.value())).ok_or_else(|| {
            RestoreError::Transport {
                node,
                reason: "no loopback handler registered (node not in cluster)".into(),
            }
        })
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn send_prepare(&self, to: NodeId, request: OperationRequest) -> Result<PrepareResponse> {
        self.lookup(to)?.handle_prepare(request).await
    }

    async fn send_phase_signal(&self, to: NodeId, request_id: crate::ids::RequestId, signal: PhaseSignal) -> Result<()> {
        self.lookup(to)?.handle_phase_signal(request_id, signal).await
    }

    async fn fetch_partition(
        &self,
        from: NodeId,
        group: &GroupId,
        partition: PartitionId,
        dest: &Path,
    ) -> Result<()> {
        let handler = self.lookup(from).map_err(|_| RestoreError::RemoteFetch {
            from,
            group: group.clone(),
            partition,
            reason: "peer not reachable".into(),
        })?;
        let bytes = handler.serve_partition(group, partition).await.map_err(|e| {
            warn!(%from, %group, partition, error = %e, "remote partition fetch failed");
            RestoreError::RemoteFetch {
                from,
                group: group.clone(),
                partition,
                reason: e.to_string(),
            }
        })?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, bytes)?;
        Ok(())
    }
}

/// A path on a remote node a partition can be fetched from, as computed
/// by the staging planner before any network call is made.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    /// The peer holding this partition.
    pub node: NodeId,
    /// Group the partition belongs to.
    pub group: GroupId,
    /// Partition id.
    pub partition: PartitionId,
}
