//! Test tooling (C15): an in-process fixture cluster for exercising the
//! distributed phase driver without a real transport or cache subsystem.
//!
//! Mirrors the shape of `durability`'s own `testing` module: a small set
//! of in-memory fakes for every external collaborator (`CacheCatalog`,
//! `CacheLifecycle`, `WalSegmentReader`/`EntryApplier`), wired together
//! over a shared `LoopbackTransport` so several simulated nodes can run
//! one restore attempt cooperatively in a single test process.

use crate::affinity::{ClusterTopology, RoundRobinAffinity};
use crate::cache_config::CacheConfig;
use crate::cache_ops::RecordingCacheLifecycle;
use crate::config::RestoreConfig;
use crate::driver::{CacheCatalog, RestoreEngine};
use crate::error::Result;
use crate::ids::{CacheId, GroupId, NodeId, PartitionId};
use crate::layout::SnapshotLayout;
use crate::membership::{MembershipEvent, MembershipListener};
use crate::metadata::SnapshotMetadata;
use crate::staging::SparseFilePuncher;
use crate::transport::{ClusterTransport, LoopbackTransport, PhaseSignal};
use crate::wal_apply::{DataEntry, EntryApplier, WalSegmentReader};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

/// A `ClusterTransport` wrapper that suspends every `fetch_partition`
/// call on a test-controlled gate: it signals `reached`, then waits for
/// `release` before delegating to the wrapped transport. Forces a real
/// suspension point inside Preload staging so a test can exercise a
/// cancel or membership change mid-attempt deterministically, instead of
/// racing a mostly-synchronous fast path with a polling loop.
pub struct GatedTransport {
    inner: Arc<dyn ClusterTransport>,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedTransport {
    /// Wrap `inner`, returning the wrapped transport and the handle a
    /// test uses to wait for the gate and release it.
    pub fn new(inner: Arc<dyn ClusterTransport>) -> (Arc<Self>, GatedTransportHandle) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let handle = GatedTransportHandle {
            reached: Arc::clone(&reached),
            release: Arc::clone(&release),
        };
        (Arc::new(Self { inner, reached, release }), handle)
    }
}

#[async_trait]
impl ClusterTransport for GatedTransport {
    async fn send_prepare(&self, to: NodeId, request: crate::wire::OperationRequest) -> Result<crate::wire::PrepareResponse> {
        self.inner.send_prepare(to, request).await
    }

    async fn send_phase_signal(&self, to: NodeId, request_id: crate::ids::RequestId, signal: PhaseSignal) -> Result<()> {
        self.inner.send_phase_signal(to, request_id, signal).await
    }

    async fn fetch_partition(&self, from: NodeId, group: &GroupId, partition: PartitionId, dest: &Path) -> Result<()> {
        self.reached.notify_one();
        self.release.notified().await;
        self.inner.fetch_partition(from, group, partition, dest).await
    }
}

/// A test's handle onto a `GatedTransport`'s gate.
pub struct GatedTransportHandle {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedTransportHandle {
    /// Wait until the gated transport's `fetch_partition` has been called.
    pub async fn wait_reached(&self) {
        self.reached.notified().await;
    }

    /// Let the blocked `fetch_partition` call proceed.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// A `SparseFilePuncher` fake that records every directory it was asked
/// to punch, so a test can assert hole-punching fired for the groups it
/// expects and not for the ones it doesn't.
#[derive(Default)]
pub struct RecordingPuncher {
    pub punched: Mutex<Vec<PathBuf>>,
}

impl RecordingPuncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SparseFilePuncher for RecordingPuncher {
    fn punch_holes(&self, group_dir: &Path) -> Result<()> {
        self.punched.lock().push(group_dir.to_path_buf());
        Ok(())
    }
}

/// A `CacheCatalog` fake backed by a plain in-memory map, scoped to one
/// simulated node. Final directories live under that node's own snapshot
/// root so Prepare's "target directory must be empty" check behaves like
/// a real node that hasn't restored anything yet.
pub struct FixtureCatalog {
    root: PathBuf,
    known_caches: Mutex<BTreeSet<CacheId>>,
    configs: Mutex<BTreeMap<GroupId, Vec<CacheConfig>>>,
}

impl FixtureCatalog {
    /// A catalog rooted under `root`, with no caches and no configs yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            known_caches: Mutex::new(BTreeSet::new()),
            configs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a cache config as locally known for its group, as if a
    /// prior `GridCacheProcessor`-equivalent had already loaded it.
    pub fn register_config(&self, cfg: CacheConfig) {
        self.configs.lock().entry(cfg.group_id.clone()).or_default().push(cfg);
    }

    /// Mark a cache id as already existing locally, so Prepare rejects a
    /// restore attempt that would try to recreate it.
    pub fn mark_cache_exists(&self, cache_id: CacheId) {
        self.known_caches.lock().insert(cache_id);
    }
}

impl CacheCatalog for FixtureCatalog {
    fn final_group_dir(&self, group: &GroupId) -> PathBuf {
        self.root.join("caches").join(&group.0)
    }

    fn cache_exists(&self, cache_id: &CacheId) -> bool {
        self.known_caches.lock().contains(cache_id)
    }

    fn local_configs_for(&self, groups: &BTreeSet<GroupId>) -> Vec<CacheConfig> {
        let configs = self.configs.lock();
        groups.iter().flat_map(|g| configs.get(g).cloned().unwrap_or_default()).collect()
    }
}

/// A single WAL entry, programmed ahead of time into a `FixtureWal`.
#[derive(Debug, Clone)]
pub struct FixtureEntry {
    pub group: GroupId,
    pub partition: PartitionId,
    pub counter: u64,
}

impl DataEntry for FixtureEntry {
    fn group(&self) -> &GroupId {
        &self.group
    }
    fn partition(&self) -> Option<PartitionId> {
        Some(self.partition)
    }
    fn key(&self) -> &[u8] {
        b"fixture-entry-key"
    }
    fn update_counter(&self) -> u64 {
        self.counter
    }
}

/// A programmable `WalSegmentReader` + `EntryApplier`: segments per
/// increment index are supplied up front, and every applied entry is
/// recorded so a test can assert on replay order and counter gaps.
#[derive(Default)]
pub struct FixtureWal {
    segments_per_index: Mutex<BTreeMap<u32, Vec<Vec<FixtureEntry>>>>,
    applied: Mutex<Vec<FixtureEntry>>,
}

impl FixtureWal {
    /// An empty WAL fixture with no programmed segments.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Program one segment of entries for increment `index`, appended
    /// after any segments already programmed for that index.
    pub fn push_segment(&self, index: u32, entries: Vec<FixtureEntry>) {
        self.segments_per_index.lock().entry(index).or_default().push(entries);
    }

    /// Every entry applied so far, in application order.
    pub fn applied(&self) -> Vec<FixtureEntry> {
        self.applied.lock().clone()
    }
}

impl WalSegmentReader for FixtureWal {
    fn list_segments(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let index: u32 = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let count = self.segments_per_index.lock().get(&index).map(|s| s.len()).unwrap_or(0);
        Ok((0..count).map(|i| dir.join(format!("seg-{i}.wal"))).collect())
    }

    fn read_segment(&self, path: &Path) -> Result<Vec<Box<dyn DataEntry>>> {
        let index: u32 = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let seg_idx: usize = path
            .file_stem()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("seg-"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let segments = self.segments_per_index.lock();
        let entries = segments
            .get(&index)
            .and_then(|segs| segs.get(seg_idx))
            .cloned()
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|e| Box::new(e) as Box<dyn DataEntry>)
            .collect())
    }
}

impl EntryApplier for FixtureWal {
    fn apply(&self, entry: &dyn DataEntry) -> Result<()> {
        self.applied.lock().push(FixtureEntry {
            group: entry.group().clone(),
            partition: entry.partition().unwrap_or_default(),
            counter: entry.update_counter(),
        });
        Ok(())
    }
}

/// One simulated cluster member: its own snapshot directory tree, its
/// own cache catalog and cache lifecycle recorder, and the engine that
/// ties them together.
pub struct FixtureNode {
    pub node_id: NodeId,
    pub engine: Arc<RestoreEngine>,
    pub catalog: Arc<FixtureCatalog>,
    pub lifecycle: Arc<RecordingCacheLifecycle>,
    pub wal: Arc<FixtureWal>,
    pub puncher: Arc<RecordingPuncher>,
    layout: SnapshotLayout,
    folder_name: String,
}

impl FixtureNode {
    /// Write this node's metadata file for `snapshot_name`, creating its
    /// node snapshot directory if needed.
    pub fn write_metadata(&self, snapshot_name: &str, meta: &SnapshotMetadata) {
        let node_dir = self.layout.node_snapshot_dir(snapshot_name, &self.folder_name, &self.node_id.to_string());
        std::fs::create_dir_all(&node_dir).unwrap();
        meta.write_to(&self.layout.metadata_file(&node_dir)).unwrap();
    }

    /// Write one partition file's bytes under this node's snapshot
    /// directory for `(snapshot_name, group, partition)`.
    pub fn write_partition(&self, snapshot_name: &str, group: &GroupId, partition: PartitionId, bytes: &[u8]) {
        let node_dir = self.layout.node_snapshot_dir(snapshot_name, &self.folder_name, &self.node_id.to_string());
        let group_dir = self.layout.group_dir(&node_dir, group);
        std::fs::create_dir_all(&group_dir).unwrap();
        let path = self.layout.partition_file(&group_dir, partition);
        std::fs::write(path, bytes).unwrap();
    }

    /// This node's final on-disk directory for `group`, once restored.
    pub fn final_group_dir(&self, group: &GroupId) -> PathBuf {
        self.catalog.final_group_dir(group)
    }
}

/// A fixture cluster of cooperating `RestoreEngine`s sharing one
/// `LoopbackTransport`, one tempdir-backed snapshot root per node, and a
/// deterministic `RoundRobinAffinity`. Built with `FixtureCluster::new`,
/// which spins up `node_count` nodes, all baseline, all alive.
pub struct FixtureCluster {
    _root: TempDir,
    transport: Arc<LoopbackTransport>,
    pub nodes: Vec<FixtureNode>,
    pub baseline: BTreeSet<NodeId>,
    folder_name: String,
}

impl FixtureCluster {
    /// Build a cluster of `node_count` baseline nodes, all registered on
    /// a shared loopback transport, sharing the `db0` folder name.
    pub fn new(node_count: usize) -> Self {
        Self::with_folder_name(node_count, "db0")
    }

    /// Same as `new`, but with an explicit folder name (the second path
    /// segment under a snapshot's per-node directory).
    pub fn with_folder_name(node_count: usize, folder_name: &str) -> Self {
        Self::with_affinity(node_count, folder_name, Arc::new(RoundRobinAffinity::new()))
    }

    /// Same as `new`, but with an explicit affinity function, so a test
    /// can pin specific `(group, partition)` assignments to force a
    /// remote fetch between two otherwise-identical fixture nodes.
    pub fn with_affinity(node_count: usize, folder_name: &str, affinity: Arc<dyn crate::affinity::AffinityFunction>) -> Self {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(LoopbackTransport::new());
        let node_ids: Vec<NodeId> = (0..node_count).map(|_| NodeId::new()).collect();
        let baseline: BTreeSet<NodeId> = node_ids.iter().copied().collect();

        let mut nodes = Vec::with_capacity(node_count);
        for node_id in node_ids {
            let layout = SnapshotLayout::new(root.path());
            let catalog = Arc::new(FixtureCatalog::new(root.path().join(node_id.to_string())));
            let lifecycle = Arc::new(RecordingCacheLifecycle::new());
            let wal = FixtureWal::new();
            let puncher = RecordingPuncher::new();
            let topology = ClusterTopology::all_alive(baseline.clone());

            let engine = Arc::new(RestoreEngine::new(
                node_id,
                folder_name,
                node_id.to_string(),
                layout.clone(),
                topology,
                Arc::clone(&affinity),
                Arc::clone(&transport) as Arc<dyn crate::transport::ClusterTransport>,
                Arc::clone(&lifecycle) as Arc<dyn crate::cache_ops::CacheLifecycle>,
                Arc::clone(&catalog) as Arc<dyn CacheCatalog>,
                Arc::clone(&wal) as Arc<dyn WalSegmentReader>,
                Arc::clone(&wal) as Arc<dyn EntryApplier>,
                Arc::clone(&puncher) as Arc<dyn SparseFilePuncher>,
                RestoreConfig::default(),
            ));
            transport.register(node_id, Arc::clone(&engine) as Arc<dyn crate::transport::LoopbackNode>);

            nodes.push(FixtureNode {
                node_id,
                engine,
                catalog,
                lifecycle,
                wal,
                puncher,
                layout,
                folder_name: folder_name.to_string(),
            });
        }

        Self {
            _root: root,
            transport,
            nodes,
            baseline,
            folder_name: folder_name.to_string(),
        }
    }

    /// Same as `with_affinity`, but node `gated_index`'s outbound
    /// transport is wrapped in a `GatedTransport`, whose handle is
    /// returned alongside the cluster. Lets a test force a deterministic
    /// suspension inside that node's remote partition fetches.
    pub fn with_gated_node(
        node_count: usize,
        folder_name: &str,
        affinity: Arc<dyn crate::affinity::AffinityFunction>,
        gated_index: usize,
    ) -> (Self, GatedTransportHandle) {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(LoopbackTransport::new());
        let node_ids: Vec<NodeId> = (0..node_count).map(|_| NodeId::new()).collect();
        let baseline: BTreeSet<NodeId> = node_ids.iter().copied().collect();

        let mut gate_handle = None;
        let mut nodes = Vec::with_capacity(node_count);
        for (index, node_id) in node_ids.into_iter().enumerate() {
            let layout = SnapshotLayout::new(root.path());
            let catalog = Arc::new(FixtureCatalog::new(root.path().join(node_id.to_string())));
            let lifecycle = Arc::new(RecordingCacheLifecycle::new());
            let wal = FixtureWal::new();
            let puncher = RecordingPuncher::new();
            let topology = ClusterTopology::all_alive(baseline.clone());

            let outbound: Arc<dyn ClusterTransport> = if index == gated_index {
                let (gated, handle) = GatedTransport::new(Arc::clone(&transport) as Arc<dyn ClusterTransport>);
                gate_handle = Some(handle);
                gated
            } else {
                Arc::clone(&transport) as Arc<dyn ClusterTransport>
            };

            let engine = Arc::new(RestoreEngine::new(
                node_id,
                folder_name,
                node_id.to_string(),
                layout.clone(),
                topology,
                Arc::clone(&affinity),
                outbound,
                Arc::clone(&lifecycle) as Arc<dyn crate::cache_ops::CacheLifecycle>,
                Arc::clone(&catalog) as Arc<dyn CacheCatalog>,
                Arc::clone(&wal) as Arc<dyn WalSegmentReader>,
                Arc::clone(&wal) as Arc<dyn EntryApplier>,
                Arc::clone(&puncher) as Arc<dyn SparseFilePuncher>,
                RestoreConfig::default(),
            ));
            transport.register(node_id, Arc::clone(&engine) as Arc<dyn crate::transport::LoopbackNode>);

            nodes.push(FixtureNode {
                node_id,
                engine,
                catalog,
                lifecycle,
                wal,
                puncher,
                layout,
                folder_name: folder_name.to_string(),
            });
        }

        let cluster = Self {
            _root: root,
            transport,
            nodes,
            baseline,
            folder_name: folder_name.to_string(),
        };
        (cluster, gate_handle.expect("gated_index must be < node_count"))
    }

    /// The node at `index`.
    pub fn node(&self, index: usize) -> &FixtureNode {
        &self.nodes[index]
    }

    /// Write identical partition bytes and a consistent `SnapshotMetadata`
    /// for `group`'s partitions `0..partition_count` to every node, as if
    /// a prior snapshot operation had already replicated them everywhere.
    pub fn seed_base_snapshot(&self, snapshot_name: &str, group: &GroupId, partition_count: u32) {
        for node in &self.nodes {
            let mut partitions = BTreeMap::new();
            partitions.insert(group.clone(), (0..partition_count).collect::<BTreeSet<_>>());
            let meta = SnapshotMetadata {
                node_id: node.node_id,
                page_size: 4096,
                consistent_id: node.node_id.to_string(),
                folder_name: self.folder_name.clone(),
                baseline: self.baseline.clone(),
                partitions,
                only_primary: false,
                compressed_groups: BTreeSet::new(),
            };
            node.write_metadata(snapshot_name, &meta);
            for partition in 0..partition_count {
                node.write_partition(snapshot_name, group, partition, format!("page-{partition}").as_bytes());
            }
        }
    }

    /// Same as `seed_base_snapshot`, but marks `group` as compressed in
    /// every node's metadata, so Preload staging hole-punches it once
    /// staged (subject to `RestoreConfig.hole_punch_enabled`).
    pub fn seed_base_snapshot_compressed(&self, snapshot_name: &str, group: &GroupId, partition_count: u32) {
        for node in &self.nodes {
            let mut partitions = BTreeMap::new();
            partitions.insert(group.clone(), (0..partition_count).collect::<BTreeSet<_>>());
            let meta = SnapshotMetadata {
                node_id: node.node_id,
                page_size: 4096,
                consistent_id: node.node_id.to_string(),
                folder_name: self.folder_name.clone(),
                baseline: self.baseline.clone(),
                partitions,
                only_primary: false,
                compressed_groups: BTreeSet::from([group.clone()]),
            };
            node.write_metadata(snapshot_name, &meta);
            for partition in 0..partition_count {
                node.write_partition(snapshot_name, group, partition, format!("page-{partition}").as_bytes());
            }
        }
    }

    /// Same as `seed_base_snapshot`, but also gives every node an index
    /// partition for `group`, so a test can exercise the staging
    /// planner's index-partition bulk copy alongside a local,
    /// exact-partition-set match.
    pub fn seed_base_snapshot_with_index(&self, snapshot_name: &str, group: &GroupId, partition_count: u32) {
        use crate::ids::INDEX_PARTITION;

        for node in &self.nodes {
            let mut parts: BTreeSet<_> = (0..partition_count).collect();
            parts.insert(INDEX_PARTITION);
            let mut partitions = BTreeMap::new();
            partitions.insert(group.clone(), parts);
            let meta = SnapshotMetadata {
                node_id: node.node_id,
                page_size: 4096,
                consistent_id: node.node_id.to_string(),
                folder_name: self.folder_name.clone(),
                baseline: self.baseline.clone(),
                partitions,
                only_primary: false,
                compressed_groups: BTreeSet::new(),
            };
            node.write_metadata(snapshot_name, &meta);
            for partition in 0..partition_count {
                node.write_partition(snapshot_name, group, partition, format!("page-{partition}").as_bytes());
            }
            node.write_partition(snapshot_name, group, INDEX_PARTITION, b"index-pages");
        }
    }

    /// Write a full copy of `group`'s partitions `0..partition_count`
    /// only to `nodes[owner]`, while every other node gets a metadata
    /// file that lists no partitions for `group` at all. Staging `group`
    /// on a non-owner node therefore has no local candidate and must
    /// fetch every partition from the owner over the loopback transport.
    pub fn seed_owner_only(&self, snapshot_name: &str, group: &GroupId, partition_count: u32, owner: usize) {
        for (index, node) in self.nodes.iter().enumerate() {
            let mut partitions = BTreeMap::new();
            if index == owner {
                partitions.insert(group.clone(), (0..partition_count).collect::<BTreeSet<_>>());
            }
            let meta = SnapshotMetadata {
                node_id: node.node_id,
                page_size: 4096,
                consistent_id: node.node_id.to_string(),
                folder_name: self.folder_name.clone(),
                baseline: self.baseline.clone(),
                partitions,
                only_primary: false,
                compressed_groups: BTreeSet::new(),
            };
            node.write_metadata(snapshot_name, &meta);
            if index == owner {
                for partition in 0..partition_count {
                    node.write_partition(snapshot_name, group, partition, format!("page-{partition}").as_bytes());
                }
            }
        }
    }

    /// Simulate `node_id` leaving the cluster: deregister it from the
    /// transport (future RPCs to it fail) and notify every other node's
    /// membership listener.
    pub fn disconnect(&self, node_id: NodeId) {
        self.transport.unregister(&node_id);
        for node in &self.nodes {
            if node.node_id != node_id {
                node.engine.notify(MembershipEvent::NodeLeft(node_id));
            }
        }
    }

    /// Sever `node_id` at the transport level only, without notifying
    /// any membership listener: models a network partition a gossip
    /// layer hasn't detected yet. A Prepare broadcast to `node_id` fails
    /// with a transport error even though every node's topology still
    /// considers it alive and required.
    pub fn sever_transport(&self, node_id: NodeId) {
        self.transport.unregister(&node_id);
    }

    /// Simulate `node_id` rejoining, the inverse of `disconnect`.
    pub fn reconnect(&self, node_id: NodeId) {
        let rejoined = self.nodes.iter().find(|n| n.node_id == node_id).unwrap();
        self.transport
            .register(node_id, Arc::clone(&rejoined.engine) as Arc<dyn crate::transport::LoopbackNode>);
        for node in &self.nodes {
            if node.node_id != node_id {
                node.engine.notify(MembershipEvent::NodeJoined(node_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_node_cluster_restores_a_seeded_snapshot() {
        let cluster = FixtureCluster::new(1);
        let group: GroupId = "orders".into();
        cluster.seed_base_snapshot("nightly", &group, 2);

        cluster.node(0).engine.start("nightly", None, None, 0).await.unwrap();

        let final_dir = cluster.node(0).final_group_dir(&group);
        assert!(final_dir.join("part-0.bin").exists());
        assert!(final_dir.join("part-1.bin").exists());
        assert_eq!(cluster.node(0).lifecycle.started.lock().len(), 1);
    }

    #[tokio::test]
    async fn two_node_cluster_fetches_owner_only_partitions_over_loopback() {
        let cluster = FixtureCluster::new(2);
        let group: GroupId = "orders".into();
        cluster.seed_owner_only("nightly", &group, 4, 0);

        let groups = BTreeSet::from([group.clone()]);
        cluster.node(0).engine.start("nightly", None, Some(groups), 0).await.unwrap();

        for node in &cluster.nodes {
            let final_dir = node.final_group_dir(&group);
            for partition in 0..4 {
                assert!(
                    final_dir.join(format!("part-{partition}.bin")).exists(),
                    "node {} missing partition {partition}",
                    node.node_id
                );
            }
        }
    }

    #[tokio::test]
    async fn severed_peer_fails_prepare_and_starts_no_caches() {
        let cluster = FixtureCluster::new(2);
        let group: GroupId = "orders".into();
        cluster.seed_base_snapshot("nightly", &group, 2);

        let second = cluster.node(1).node_id;
        cluster.sever_transport(second);

        let err = cluster.node(0).engine.start("nightly", None, None, 0).await.unwrap_err();
        assert!(matches!(err, crate::error::RestoreError::Transport { .. }));
        assert!(cluster.node(0).lifecycle.started.lock().is_empty());
    }

    #[tokio::test]
    async fn compressed_group_is_hole_punched_after_staging() {
        let cluster = FixtureCluster::new(1);
        let group: GroupId = "orders".into();
        cluster.seed_base_snapshot_compressed("nightly", &group, 2);

        cluster.node(0).engine.start("nightly", None, None, 0).await.unwrap();

        assert_eq!(cluster.node(0).puncher.punched.lock().len(), 1);
    }

    #[test]
    fn fixture_wal_records_applied_entries_in_order() {
        let wal = FixtureWal::new();
        let group: GroupId = "orders".into();
        wal.push_segment(
            1,
            vec![
                FixtureEntry { group: group.clone(), partition: 0, counter: 1 },
                FixtureEntry { group: group.clone(), partition: 0, counter: 2 },
            ],
        );
        let segments = wal.list_segments(Path::new("1")).unwrap();
        assert_eq!(segments.len(), 1);
        let entries = wal.read_segment(&segments[0]).unwrap();
        for entry in &entries {
            wal.apply(entry.as_ref()).unwrap();
        }
        assert_eq!(wal.applied().len(), 2);
    }
}
