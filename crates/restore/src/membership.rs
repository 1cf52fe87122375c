//! Membership listener (C10).
//!
//! Cluster membership tracking is an external collaborator (spec §1):
//! this module only defines the notification contract the restore engine
//! reacts to. A real integrator wires its own discovery/gossip layer to
//! call `notify` whenever a node joins or leaves; the in-process fixture
//! cluster (C15) calls it directly when a test disconnects a node.

use crate::driver::RestoreEngine;
use crate::ids::NodeId;

/// A cluster membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node left the cluster (crashed, was shut down, or partitioned away).
    NodeLeft(NodeId),
    /// A node (re)joined the cluster.
    NodeJoined(NodeId),
}

/// Receives membership change notifications. Implemented for
/// `RestoreEngine`; a real integrator's discovery layer calls `notify`
/// directly on each node's engine instance.
pub trait MembershipListener: Send + Sync {
    /// React to a membership change.
    fn notify(&self, event: MembershipEvent);
}

impl MembershipListener for RestoreEngine {
    fn notify(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::NodeLeft(node) => self.on_node_left(node),
            MembershipEvent::NodeJoined(node) => self.on_node_joined(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{ClusterTopology, RoundRobinAffinity};
    use crate::cache_config::CacheConfig;
    use crate::cache_ops::RecordingCacheLifecycle;
    use crate::config::RestoreConfig;
    use crate::driver::CacheCatalog;
    use crate::error::Result;
    use crate::ids::{CacheId, GroupId, RequestId};
    use crate::layout::SnapshotLayout;
    use crate::metadata::SnapshotMetadata;
    use crate::transport::{LoopbackNode, LoopbackTransport};
    use crate::wal_apply::{DataEntry, EntryApplier, WalSegmentReader};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct NoCatalog;
    impl CacheCatalog for NoCatalog {
        fn final_group_dir(&self, group: &GroupId) -> PathBuf {
            PathBuf::from(group.0.clone())
        }
        fn cache_exists(&self, _cache_id: &CacheId) -> bool {
            false
        }
        fn local_configs_for(&self, _groups: &BTreeSet<GroupId>) -> Vec<CacheConfig> {
            Vec::new()
        }
    }

    struct NoReader;
    impl WalSegmentReader for NoReader {
        fn list_segments(&self, _dir: &std::path::Path) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }
        fn read_segment(&self, _path: &std::path::Path) -> Result<Vec<Box<dyn DataEntry>>> {
            Ok(Vec::new())
        }
    }

    struct NoApplier;
    impl EntryApplier for NoApplier {
        fn apply(&self, _entry: &dyn DataEntry) -> Result<()> {
            Ok(())
        }
    }

    fn test_engine(dir: &std::path::Path, local_node: NodeId, baseline: BTreeSet<NodeId>) -> RestoreEngine {
        RestoreEngine::new(
            local_node,
            "db0",
            local_node.to_string(),
            SnapshotLayout::new(dir),
            ClusterTopology::all_alive(baseline),
            Arc::new(RoundRobinAffinity::new()),
            Arc::new(LoopbackTransport::new()),
            Arc::new(RecordingCacheLifecycle::new()),
            Arc::new(NoCatalog),
            Arc::new(NoReader),
            Arc::new(NoApplier),
            Arc::new(crate::staging::NoopPuncher),
            RestoreConfig::default(),
        )
    }

    #[test]
    fn node_left_removes_it_from_the_alive_set() {
        let dir = tempdir().unwrap();
        let a = NodeId::new();
        let b = NodeId::new();
        let engine = test_engine(dir.path(), a, BTreeSet::from([a, b]));

        engine.notify(MembershipEvent::NodeLeft(b));
        assert!(!engine.is_alive(b));
    }

    #[tokio::test]
    async fn node_left_trips_the_in_flight_context_when_required() {
        let dir = tempdir().unwrap();
        let a = NodeId::new();
        let b = NodeId::new();
        let engine = test_engine(dir.path(), a, BTreeSet::from([a, b]));

        let layout = SnapshotLayout::new(dir.path());
        let node_dir = layout.node_snapshot_dir("nightly", "db0", &a.to_string());
        std::fs::create_dir_all(&node_dir).unwrap();
        let meta = SnapshotMetadata {
            node_id: a,
            page_size: 4096,
            consistent_id: a.to_string(),
            folder_name: "db0".into(),
            baseline: BTreeSet::from([a, b]),
            partitions: BTreeMap::new(),
            only_primary: false,
            compressed_groups: BTreeSet::new(),
        };
        meta.write_to(&layout.metadata_file(&node_dir)).unwrap();

        let request = crate::wire::OperationRequest {
            request_id: RequestId::new(),
            originator: a,
            snapshot_name: "nightly".into(),
            snapshot_path: None,
            groups: None,
            baseline: BTreeSet::from([a, b]),
            incremental_index: 0,
            only_primary: false,
        };
        engine.handle_prepare(request).await.unwrap();

        engine.notify(MembershipEvent::NodeLeft(b));
        assert!(engine.metrics().unwrap().error.is_some());
    }

    #[test]
    fn node_joined_adds_it_back_to_the_alive_set() {
        let dir = tempdir().unwrap();
        let a = NodeId::new();
        let b = NodeId::new();
        let engine = test_engine(dir.path(), a, BTreeSet::from([a, b]));

        engine.notify(MembershipEvent::NodeLeft(b));
        engine.notify(MembershipEvent::NodeJoined(b));
        assert!(engine.is_alive(b));
    }
}
