//! Restore attempt context (C4).
//!
//! One `RestoreContext` exists per in-flight attempt. It is the shared,
//! mutable-but-disciplined state every phase handler reads and writes:
//! the staging plan built during Prepare, the error latch any stage can
//! trip, and the progress counters the metrics snapshot reads. The
//! driver holds the one in-flight context behind its own `current`
//! field and passes `&RestoreContext`/`Arc<RestoreContext>` down to
//! every phase handler explicitly.

use crate::cache_config::CacheConfig;
use crate::descriptor::SnapshotDescriptor;
use crate::error::RestoreError;
use crate::ids::{CacheId, GroupId, NodeId, RequestId};
use crate::metadata::SnapshotMetadata;
use crate::sync_util::{Completion, ErrorLatch, StripedCounter};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// The staging plan built during Prepare and consumed by every later
/// phase. Populated once, near-immutable afterward; the `RwLock`s exist
/// for the narrow window where Prepare responses are still arriving.
#[derive(Debug, Default)]
struct Plan {
    /// Final (post-restore) cache directories, per group, in the order
    /// they were staged — used by the directory switch step.
    final_dirs: RwLock<BTreeMap<GroupId, Vec<PathBuf>>>,
    /// Cache configs collected from Prepare responses, by cache id.
    cache_configs: RwLock<BTreeMap<CacheId, CacheConfig>>,
    /// Snapshot metadata collected from Prepare responses, by node.
    metadata_by_node: RwLock<BTreeMap<NodeId, Vec<SnapshotMetadata>>>,
    /// Groups whose source pages are compressed (hole-punch eligible).
    compressed_groups: RwLock<BTreeSet<GroupId>>,
}

/// Final outcome recorded when an attempt finishes, used both to report
/// through `Completion` and to populate the metrics snapshot.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every phase completed successfully.
    Success,
    /// The attempt failed and was rolled back; carries the triggering error.
    Failed(Arc<RestoreError>),
}

/// Shared state for one restore attempt.
pub struct RestoreContext {
    /// Unique id for this attempt.
    pub request_id: RequestId,
    /// What to restore.
    pub descriptor: SnapshotDescriptor,
    /// The node that originated the request.
    pub originator: NodeId,
    /// Baseline nodes required to participate; losing any of these
    /// trips `RequiredNodeLeft`.
    pub required_nodes: BTreeSet<NodeId>,
    /// Whether the snapshot only contains primary-owned partitions.
    only_primary: std::sync::atomic::AtomicBool,

    plan: Plan,

    error: ErrorLatch<RestoreError>,
    completion: Completion<Outcome>,

    total_partitions: AtomicU64,
    processed_partitions: AtomicU64,
    total_wal_segments: AtomicU64,
    processed_wal_segments: AtomicU64,
    processed_wal_entries: StripedCounter,

    started_at: SystemTime,
    ended_at: Mutex<Option<SystemTime>>,
}

impl RestoreContext {
    /// Start a new attempt context.
    pub fn new(
        request_id: RequestId,
        descriptor: SnapshotDescriptor,
        originator: NodeId,
        required_nodes: BTreeSet<NodeId>,
    ) -> Self {
        Self {
            request_id,
            descriptor,
            originator,
            required_nodes,
            only_primary: std::sync::atomic::AtomicBool::new(false),
            plan: Plan::default(),
            error: ErrorLatch::new(),
            completion: Completion::new(),
            total_partitions: AtomicU64::new(0),
            processed_partitions: AtomicU64::new(0),
            total_wal_segments: AtomicU64::new(0),
            processed_wal_segments: AtomicU64::new(0),
            processed_wal_entries: StripedCounter::new(8),
            started_at: SystemTime::now(),
            ended_at: Mutex::new(None),
        }
    }

    // -- plan population (Prepare phase) --------------------------------

    /// Record a cache config learned from a Prepare response.
    pub fn record_cache_config(&self, cfg: CacheConfig) {
        self.plan.cache_configs.write().insert(cfg.cache_id.clone(), cfg);
    }

    /// Record snapshot metadata learned from a Prepare response.
    pub fn record_metadata(&self, node: NodeId, meta: SnapshotMetadata) {
        self.plan.metadata_by_node.write().entry(node).or_default().push(meta);
    }

    /// All metadata collected so far, across all nodes.
    pub fn all_metadata(&self) -> Vec<SnapshotMetadata> {
        self.plan
            .metadata_by_node
            .read()
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Mark a group's pages as compressed (hole-punch eligible).
    pub fn mark_compressed(&self, group: GroupId) {
        self.plan.compressed_groups.write().insert(group);
    }

    /// True if `group`'s pages are compressed.
    pub fn is_compressed(&self, group: &GroupId) -> bool {
        self.plan.compressed_groups.read().contains(group)
    }

    /// Record the final on-disk directory a group was staged into.
    pub fn record_final_dir(&self, group: GroupId, dir: PathBuf) {
        self.plan.final_dirs.write().entry(group).or_default().push(dir);
    }

    /// All final directories recorded for `group`, in staging order.
    pub fn final_dirs_for(&self, group: &GroupId) -> Vec<PathBuf> {
        self.plan.final_dirs.read().get(group).cloned().unwrap_or_default()
    }

    /// All final directories recorded across every group (used by rollback).
    pub fn all_final_dirs(&self) -> Vec<PathBuf> {
        self.plan.final_dirs.read().values().flatten().cloned().collect()
    }

    /// The groups this attempt is restoring, derived from the final
    /// directories recorded during Prepare.
    pub fn target_groups(&self) -> BTreeSet<GroupId> {
        self.plan.final_dirs.read().keys().cloned().collect()
    }

    /// Cache config for `cache_id`, if collected.
    pub fn cache_config(&self, cache_id: &CacheId) -> Option<CacheConfig> {
        self.plan.cache_configs.read().get(cache_id).cloned()
    }

    /// All cache configs collected so far.
    pub fn all_cache_configs(&self) -> Vec<CacheConfig> {
        self.plan.cache_configs.read().values().cloned().collect()
    }

    /// Set the authoritative `onlyPrimary` flag (decided once, during
    /// metadata validation at the end of Prepare).
    pub fn set_only_primary(&self, value: bool) {
        self.only_primary.store(value, Ordering::Relaxed);
    }

    /// The authoritative `onlyPrimary` flag.
    pub fn only_primary(&self) -> bool {
        self.only_primary.load(Ordering::Relaxed)
    }

    // -- progress counters (Preload / IncrementalApply) -----------------

    /// Set the total partition count once staging planning completes.
    pub fn set_total_partitions(&self, total: u64) {
        self.total_partitions.store(total, Ordering::Relaxed);
    }

    /// Record one partition finished staging.
    pub fn partition_done(&self) {
        self.processed_partitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the total WAL segment count once the incremental chain length is known.
    pub fn set_total_wal_segments(&self, total: u64) {
        self.total_wal_segments.store(total, Ordering::Relaxed);
    }

    /// Record one WAL segment finished applying.
    pub fn wal_segment_done(&self) {
        self.processed_wal_segments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` WAL entries applied. Called from many striped-executor
    /// worker threads concurrently; `StripedCounter` absorbs the contention.
    pub fn wal_entries_applied(&self, n: u64) {
        self.processed_wal_entries.add(n);
    }

    // -- error latch / cancellation --------------------------------------

    /// Trip the error latch. Only the first call wins; later calls are
    /// no-ops so the original failure reason is always the one reported.
    pub fn fail(&self, err: RestoreError) {
        if self.error.set_if_absent(err) {
            debug!(request_id = %self.request_id, "restore attempt latched first error");
        }
    }

    /// The latched error, if any.
    pub fn error(&self) -> Option<Arc<RestoreError>> {
        self.error.get()
    }

    /// True if the attempt should stop: an error has been latched or the
    /// attempt has already finished. Staging/apply workers poll this
    /// between units of work instead of threading a cancellation token.
    pub fn should_stop(&self) -> bool {
        self.error.is_set() || self.completion.is_complete()
    }

    /// Wait for the attempt to finish, returning its outcome. Safe to
    /// call from `cancel()` even if the attempt has already completed.
    pub async fn wait_finished(&self) -> Outcome {
        self.completion.wait().await
    }

    /// True if the attempt has already completed (successfully or not).
    /// `cancel()` uses this to avoid reporting success against an attempt
    /// that finished in the window between it reading the current
    /// context and latching its own interruption.
    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }

    /// Mark the attempt finished successfully. No-op if already finished
    /// (e.g. a late failure racing a just-completed success).
    pub fn finish_success(&self) {
        *self.ended_at.lock() = Some(SystemTime::now());
        self.completion.complete(Outcome::Success);
    }

    /// Mark the attempt finished with a failure, latching the error first
    /// if it hasn't been already.
    pub fn finish_failed(&self, err: RestoreError) {
        self.fail(err);
        *self.ended_at.lock() = Some(SystemTime::now());
        let err = self.error.get().expect("error latched above");
        self.completion.complete(Outcome::Failed(err));
    }

    /// Wall-clock duration since the attempt started (or its full
    /// duration, once finished).
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.lock().unwrap_or_else(SystemTime::now);
        end.duration_since(self.started_at).unwrap_or_default()
    }

    /// A point-in-time metrics snapshot (C8).
    pub fn metrics(&self) -> super::metrics::RestoreMetrics {
        super::metrics::RestoreMetrics {
            request_id: self.request_id,
            snapshot_name: self.descriptor.snapshot_name.clone(),
            incremental_index: self.descriptor.incremental_index(),
            started_at: self.started_at,
            ended_at: *self.ended_at.lock(),
            error: self.error().map(|e| e.to_string()),
            total_partitions: self.total_partitions.load(Ordering::Relaxed),
            processed_partitions: self.processed_partitions.load(Ordering::Relaxed),
            total_wal_segments: self.total_wal_segments.load(Ordering::Relaxed),
            processed_wal_segments: self.processed_wal_segments.load(Ordering::Relaxed),
            processed_wal_entries: self.processed_wal_entries.sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ctx() -> RestoreContext {
        RestoreContext::new(
            RequestId::new(),
            SnapshotDescriptor::base("nightly"),
            NodeId::new(),
            BTreeSet::new(),
        )
    }

    #[test]
    fn error_latch_stops_the_attempt() {
        let ctx = sample_ctx();
        assert!(!ctx.should_stop());
        ctx.fail(RestoreError::rejected("boom"));
        assert!(ctx.should_stop());
    }

    #[test]
    fn second_failure_does_not_override_the_first() {
        let ctx = sample_ctx();
        ctx.fail(RestoreError::rejected("first"));
        ctx.fail(RestoreError::rejected("second"));
        assert!(ctx.error().unwrap().to_string().contains("first"));
    }

    #[test]
    fn final_dirs_accumulate_per_group() {
        let ctx = sample_ctx();
        let group: GroupId = "orders".into();
        ctx.record_final_dir(group.clone(), PathBuf::from("/data/orders/0"));
        ctx.record_final_dir(group.clone(), PathBuf::from("/data/orders/1"));
        assert_eq!(ctx.final_dirs_for(&group).len(), 2);
        assert_eq!(ctx.all_final_dirs().len(), 2);
    }

    #[test]
    fn metrics_reflect_progress_counters() {
        let ctx = sample_ctx();
        ctx.set_total_partitions(4);
        ctx.partition_done();
        ctx.partition_done();
        ctx.wal_entries_applied(10);
        ctx.wal_entries_applied(5);

        let metrics = ctx.metrics();
        assert_eq!(metrics.total_partitions, 4);
        assert_eq!(metrics.processed_partitions, 2);
        assert_eq!(metrics.processed_wal_entries, 15);
    }

    #[tokio::test]
    async fn wait_finished_observes_success() {
        let ctx = Arc::new(sample_ctx());
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_finished().await })
        };
        tokio::task::yield_now().await;
        ctx.finish_success();
        assert!(matches!(waiter.await.unwrap(), Outcome::Success));
    }
}
