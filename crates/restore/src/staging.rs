//! Partition staging pipeline (C3).
//!
//! Computes where each partition of a restored group should come from
//! (a local file already on disk, or a peer that needs to be asked for
//! it), then executes that plan into a temporary staging directory. The
//! directory switch (C7) is what makes the staged result visible.

use crate::affinity::{AffinityFunction, ClusterTopology};
use crate::context::RestoreContext;
use crate::error::{RestoreError, Result};
use crate::ids::{GroupId, NodeId, PartitionId, INDEX_PARTITION};
use crate::layout::SnapshotLayout;
use crate::metadata::SnapshotMetadata;
use crate::transport::{ClusterTransport, RemoteSource};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where a single partition's bytes will come from.
#[derive(Debug, Clone)]
pub enum PartitionSource {
    /// Already present in this node's own snapshot directory.
    Local(PathBuf),
    /// Must be fetched from a peer.
    Remote(RemoteSource),
}

/// One partition's placement decision.
#[derive(Debug, Clone)]
pub struct PartitionPlacement {
    /// Group the partition belongs to.
    pub group: GroupId,
    /// Partition id.
    pub partition: PartitionId,
    /// Where to get its bytes from.
    pub source: PartitionSource,
}

/// Punches holes in a staged group's sparse partition files. External
/// collaborator (spec §4.2): the actual `fallocate(FALLOC_FL_PUNCH_HOLE)`
/// call depends on the page-store's on-disk page header format, which
/// this crate never parses — it only knows *which* directories are
/// hole-punch eligible (`RestoreContext::is_compressed`). Implementations
/// must be idempotent: punching an already-punched directory again is a
/// no-op, not an error, since a retried Preload re-stages the same group.
pub trait SparseFilePuncher: Send + Sync {
    /// Punch holes in every partition file under `group_dir`.
    fn punch_holes(&self, group_dir: &Path) -> Result<()>;
}

/// A `SparseFilePuncher` that does nothing. The default for integrators
/// that haven't wired a real one in yet; `hole_punch_enabled: false`
/// (config.rs) is the honest way to opt out, this is just what backs it.
pub struct NoopPuncher;

impl SparseFilePuncher for NoopPuncher {
    fn punch_holes(&self, _group_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Plans and executes partition staging for the groups a node owns
/// under the cluster's ideal assignment.
pub struct StagingPlanner {
    layout: SnapshotLayout,
    affinity: Arc<dyn AffinityFunction>,
    transport: Arc<dyn ClusterTransport>,
    puncher: Arc<dyn SparseFilePuncher>,
    hole_punch_enabled: bool,
    peer_shuffle_seed: u64,
}

impl StagingPlanner {
    /// Build a planner over `layout`, using `affinity` to decide ideal
    /// ownership, `transport` to fetch partitions this node lacks
    /// locally, and `puncher` to hole-punch compressed groups once
    /// staged (only called when `hole_punch_enabled` is set).
    /// `peer_shuffle_seed` makes the peer pick order deterministic for
    /// tests; production callers should vary it per attempt so load
    /// isn't always pinned to the same peer ordering.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: SnapshotLayout,
        affinity: Arc<dyn AffinityFunction>,
        transport: Arc<dyn ClusterTransport>,
        puncher: Arc<dyn SparseFilePuncher>,
        hole_punch_enabled: bool,
        peer_shuffle_seed: u64,
    ) -> Self {
        Self {
            layout,
            affinity,
            transport,
            puncher,
            hole_punch_enabled,
            peer_shuffle_seed,
        }
    }

    /// Compute the set of partitions `local_node` must stage for
    /// `group`, per the ideal assignment, and where each one's bytes
    /// should come from. The index partition is never individually
    /// affinity-assigned; it only rides along when a single local
    /// metadata's partition set for this group exactly matches what
    /// this node needs (`findMetadataWithSamePartitions`).
    ///
    /// `metas` is every `SnapshotMetadata` collected during Prepare
    /// (one or more per node). Local-copy candidates are drawn from
    /// entries whose `node_id == local_node` first; everything else is
    /// a remote-fetch candidate.
    pub fn plan_group(
        &self,
        snapshot_name: &str,
        group: &GroupId,
        local_node: NodeId,
        topology: &ClusterTopology,
        metas: &[SnapshotMetadata],
    ) -> Vec<PartitionPlacement> {
        let universe: BTreeSet<PartitionId> = metas
            .iter()
            .flat_map(|m| m.partitions_for(group))
            .filter(|p| *p != INDEX_PARTITION)
            .collect();

        let required: BTreeSet<PartitionId> = universe
            .into_iter()
            .filter(|&partition| {
                self.affinity
                    .ideal_assignment(group, partition, topology)
                    .contains(&local_node)
            })
            .collect();

        if let Some((source_meta, group_dir)) =
            self.find_metadata_with_same_partitions(snapshot_name, group, &required, local_node, metas)
        {
            let mut placements: Vec<PartitionPlacement> = required
                .iter()
                .map(|&partition| PartitionPlacement {
                    group: group.clone(),
                    partition,
                    source: PartitionSource::Local(self.layout.partition_file(&group_dir, partition)),
                })
                .collect();
            if source_meta.partitions_for(group).contains(&INDEX_PARTITION) {
                placements.push(PartitionPlacement {
                    group: group.clone(),
                    partition: INDEX_PARTITION,
                    source: PartitionSource::Local(self.layout.partition_file(&group_dir, INDEX_PARTITION)),
                });
            }
            return placements;
        }

        let mut rng = StdRng::seed_from_u64(self.peer_shuffle_seed);
        let mut placements = Vec::new();

        for partition in required {
            if let Some(local_path) =
                self.find_local_source(snapshot_name, group, partition, local_node, metas)
            {
                placements.push(PartitionPlacement {
                    group: group.clone(),
                    partition,
                    source: PartitionSource::Local(local_path),
                });
                continue;
            }

            let mut peers: Vec<NodeId> = metas
                .iter()
                .filter(|m| m.node_id != local_node && m.partitions_for(group).contains(&partition))
                .map(|m| m.node_id)
                .collect();
            peers.sort();
            peers.shuffle(&mut rng);

            match peers.first() {
                Some(&peer) => placements.push(PartitionPlacement {
                    group: group.clone(),
                    partition,
                    source: PartitionSource::Remote(RemoteSource {
                        node: peer,
                        group: group.clone(),
                        partition,
                    }),
                }),
                None => {
                    debug!(%group, partition, "no source found for partition; leaving unplaced");
                }
            }
        }

        placements
    }

    /// Find the single local metadata whose non-index partition set for
    /// `group` exactly equals `required`, per the spec's
    /// `findMetadataWithSamePartitions`. Returns that metadata plus its
    /// resolved group directory so the caller can also pick up its
    /// index partition, if any.
    fn find_metadata_with_same_partitions<'a>(
        &self,
        snapshot_name: &str,
        group: &GroupId,
        required: &BTreeSet<PartitionId>,
        local_node: NodeId,
        metas: &'a [SnapshotMetadata],
    ) -> Option<(&'a SnapshotMetadata, PathBuf)> {
        if required.is_empty() {
            return None;
        }
        let source_meta = metas.iter().find(|m| {
            m.node_id == local_node
                && m.partitions_for(group)
                    .iter()
                    .filter(|&&p| p != INDEX_PARTITION)
                    .copied()
                    .collect::<BTreeSet<_>>()
                    == *required
        })?;
        let node_dir = self.layout.node_snapshot_dir(
            snapshot_name,
            &source_meta.folder_name,
            &source_meta.consistent_id,
        );
        let group_dir = self.layout.group_dir(&node_dir, group);
        Some((source_meta, group_dir))
    }

    fn find_local_source(
        &self,
        snapshot_name: &str,
        group: &GroupId,
        partition: PartitionId,
        local_node: NodeId,
        metas: &[SnapshotMetadata],
    ) -> Option<PathBuf> {
        let own = metas
            .iter()
            .find(|m| m.node_id == local_node && m.partitions_for(group).contains(&partition))?;
        let node_dir = self
            .layout
            .node_snapshot_dir(snapshot_name, &own.folder_name, &own.consistent_id);
        let group_dir = self.layout.group_dir(&node_dir, group);
        Some(self.layout.partition_file(&group_dir, partition))
    }

    /// Execute a group's placements into `staging_group_dir`, copying
    /// local files and fetching remote ones. Stops at the first
    /// failure, or early if `ctx` has already latched an error from
    /// another concurrently staging group.
    pub async fn stage_group(
        &self,
        ctx: &RestoreContext,
        staging_group_dir: &Path,
        placements: &[PartitionPlacement],
    ) -> Result<()> {
        std::fs::create_dir_all(staging_group_dir)?;

        for placement in placements {
            if ctx.should_stop() {
                return Err(RestoreError::Interrupted(
                    "restore attempt stopped during staging".into(),
                ));
            }

            let dest = self.layout.partition_file(staging_group_dir, placement.partition);
            match &placement.source {
                PartitionSource::Local(src) => {
                    std::fs::copy(src, &dest)?;
                }
                PartitionSource::Remote(remote) => {
                    self.transport
                        .fetch_partition(remote.node, &remote.group, remote.partition, &dest)
                        .await?;
                }
            }
            ctx.partition_done();
        }

        if self.hole_punch_enabled
            && ctx.is_compressed(&placements.first().map(|p| p.group.clone()).unwrap_or_else(|| GroupId("".into())))
        {
            self.puncher.punch_holes(staging_group_dir)?;
        }

        info!(dir = %staging_group_dir.display(), count = placements.len(), "staged group partitions");
        Ok(())
    }
}

/// Local-copy plan for all groups, keyed for convenience: `group ->
/// placements`. Built once per attempt from `plan_group`, then staged
/// concurrently (each group independent) by the driver.
pub fn plan_all_groups(
    planner: &StagingPlanner,
    snapshot_name: &str,
    groups: &BTreeSet<GroupId>,
    local_node: NodeId,
    topology: &ClusterTopology,
    metas: &[SnapshotMetadata],
) -> BTreeMap<GroupId, Vec<PartitionPlacement>> {
    groups
        .iter()
        .map(|g| {
            (
                g.clone(),
                planner.plan_group(snapshot_name, g, local_node, topology, metas),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::RoundRobinAffinity;
    use crate::descriptor::SnapshotDescriptor;
    use crate::ids::RequestId;
    use crate::transport::LoopbackTransport;
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn meta(node: NodeId, group: &str, partitions: &[PartitionId]) -> SnapshotMetadata {
        let mut map = Map::new();
        map.insert(GroupId::from(group), partitions.iter().copied().collect());
        SnapshotMetadata {
            node_id: node,
            page_size: 4096,
            consistent_id: node.to_string(),
            folder_name: "db0".into(),
            baseline: BTreeSet::new(),
            partitions: map,
            only_primary: false,
            compressed_groups: BTreeSet::new(),
        }
    }

    #[test]
    fn plan_prefers_local_source_when_available() {
        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let node = NodeId::new();
        let affinity = Arc::new(RoundRobinAffinity::new());
        let transport = Arc::new(LoopbackTransport::new());
        let planner = StagingPlanner::new(layout, affinity, transport, Arc::new(NoopPuncher), false, 1);
        let topo = ClusterTopology::all_alive([node]);
        let group: GroupId = "orders".into();
        let metas = vec![meta(node, "orders", &[0, 1])];

        let placements = planner.plan_group("nightly", &group, node, &topo, &metas);
        assert_eq!(placements.len(), 2);
        assert!(placements.iter().all(|p| matches!(p.source, PartitionSource::Local(_))));
    }

    #[test]
    fn plan_copies_index_partition_alongside_an_exact_partition_set_match() {
        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let node = NodeId::new();
        let affinity = Arc::new(RoundRobinAffinity::new());
        let transport = Arc::new(LoopbackTransport::new());
        let planner = StagingPlanner::new(layout, affinity, transport, Arc::new(NoopPuncher), false, 1);
        let topo = ClusterTopology::all_alive([node]);
        let group: GroupId = "orders".into();
        let metas = vec![meta(node, "orders", &[0, 1, INDEX_PARTITION])];

        let placements = planner.plan_group("nightly", &group, node, &topo, &metas);
        assert_eq!(placements.len(), 3);
        assert!(placements.iter().all(|p| matches!(p.source, PartitionSource::Local(_))));
        assert!(placements.iter().any(|p| p.partition == INDEX_PARTITION));
    }

    #[test]
    fn plan_falls_back_to_remote_when_no_local_copy() {
        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let local = NodeId::new();
        let peer = NodeId::new();
        let affinity = Arc::new(RoundRobinAffinity::new().pin("orders", 0, vec![local]));
        let transport = Arc::new(LoopbackTransport::new());
        let planner = StagingPlanner::new(layout, affinity, transport, Arc::new(NoopPuncher), false, 7);
        let topo = ClusterTopology::all_alive([local, peer]);
        let group: GroupId = "orders".into();
        let metas = vec![meta(peer, "orders", &[0])];

        let placements = planner.plan_group("nightly", &group, local, &topo, &metas);
        assert_eq!(placements.len(), 1);
        match &placements[0].source {
            PartitionSource::Remote(r) => assert_eq!(r.node, peer),
            _ => panic!("expected remote source"),
        }
    }

    #[test]
    fn plan_skips_partitions_outside_local_ideal_assignment() {
        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let local = NodeId::new();
        let other = NodeId::new();
        let affinity = Arc::new(RoundRobinAffinity::new().pin("orders", 0, vec![other]));
        let transport = Arc::new(LoopbackTransport::new());
        let planner = StagingPlanner::new(layout, affinity, transport, Arc::new(NoopPuncher), false, 3);
        let topo = ClusterTopology::all_alive([local, other]);
        let group: GroupId = "orders".into();
        let metas = vec![meta(other, "orders", &[0])];

        let placements = planner.plan_group("nightly", &group, local, &topo, &metas);
        assert!(placements.is_empty());
    }

    #[tokio::test]
    async fn stage_group_copies_local_files_into_staging_dir() {
        let source_dir = tempdir().unwrap();
        std::fs::write(source_dir.path().join("part-0.bin"), b"hello").unwrap();

        let layout_root = tempdir().unwrap();
        let layout = SnapshotLayout::new(layout_root.path());
        let transport = Arc::new(LoopbackTransport::new());
        let affinity = Arc::new(RoundRobinAffinity::new());
        let planner = StagingPlanner::new(layout, affinity, transport, Arc::new(NoopPuncher), false, 1);

        let ctx = RestoreContext::new(
            RequestId::new(),
            SnapshotDescriptor::base("nightly"),
            NodeId::new(),
            BTreeSet::new(),
        );

        let staging_dir = tempdir().unwrap();
        let placements = vec![PartitionPlacement {
            group: "orders".into(),
            partition: 0,
            source: PartitionSource::Local(source_dir.path().join("part-0.bin")),
        }];

        planner
            .stage_group(&ctx, staging_dir.path(), &placements)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(staging_dir.path().join("part-0.bin")).unwrap(),
            b"hello"
        );
        assert_eq!(ctx.metrics().processed_partitions, 1);
    }
}
