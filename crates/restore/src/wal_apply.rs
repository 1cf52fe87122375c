//! Incremental WAL applier (C6).
//!
//! Replays increments `1..=incremental_index` on top of the staged base
//! snapshot. The WAL's own wire format is an external collaborator
//! (spec §1): this module only depends on the `DataEntry`/`WalSegmentReader`
//! iterator contract, never on a concrete log encoding. Entries are
//! dispatched to a `StripedExecutor` keyed by `(group, partition)` so
//! replay for independent partitions runs in parallel while a single
//! partition's entries stay strictly ordered.

use crate::affinity::AffinityFunction;
use crate::context::RestoreContext;
use crate::error::{RestoreError, Result};
use crate::ids::{GroupId, PartitionId};
use crate::layout::SnapshotLayout;
use crate::striped::StripedExecutor;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One replayable WAL record. Implemented by whatever durable-log
/// format the cluster actually uses.
pub trait DataEntry: Send + Sync + 'static {
    /// Cache group this entry belongs to.
    fn group(&self) -> &GroupId;
    /// Partition this entry belongs to, if the WAL format recorded one
    /// directly. `None` means the apply loop falls back to
    /// `AffinityFunction::partition` keyed by `key()` (spec §4.4: a
    /// missing partition id warns but never fails the apply).
    fn partition(&self) -> Option<PartitionId>;
    /// The entry's key, consulted only when `partition()` is `None`.
    fn key(&self) -> &[u8];
    /// Monotonic update counter this entry advances the partition to.
    fn update_counter(&self) -> u64;
}

/// Reads the WAL segment files backing one incremental snapshot
/// directory. Implementations own the on-disk encoding entirely.
pub trait WalSegmentReader: Send + Sync {
    /// List the segment files making up increment directory `dir`, in
    /// replay order.
    fn list_segments(&self, dir: &Path) -> Result<Vec<std::path::PathBuf>>;

    /// Read every entry in one segment file, in log order.
    fn read_segment(&self, path: &Path) -> Result<Vec<Box<dyn DataEntry>>>;
}

/// Applies one entry to the cache subsystem's in-memory/on-disk state.
/// Separate from `CacheLifecycle` because entry application runs on the
/// striped executor's worker tasks, potentially thousands of times per
/// segment, while lifecycle calls are coarse-grained per attempt.
pub trait EntryApplier: Send + Sync {
    /// Apply one entry. Errors here trip the attempt's error latch.
    fn apply(&self, entry: &dyn DataEntry) -> Result<()>;
}

/// Replays the incremental chain for one restore attempt.
pub struct IncrementalApplier {
    layout: SnapshotLayout,
    reader: Arc<dyn WalSegmentReader>,
    applier: Arc<dyn EntryApplier>,
    affinity: Arc<dyn AffinityFunction>,
}

impl IncrementalApplier {
    /// Build an applier over the given layout, WAL reader, entry
    /// applier, and the affinity function used to resolve entries that
    /// don't carry an explicit partition id.
    pub fn new(
        layout: SnapshotLayout,
        reader: Arc<dyn WalSegmentReader>,
        applier: Arc<dyn EntryApplier>,
        affinity: Arc<dyn AffinityFunction>,
    ) -> Self {
        Self {
            layout,
            reader,
            applier,
            affinity,
        }
    }

    /// Replay increments `1..=incremental_index` for `target_groups`
    /// (an empty set means "every group the snapshot covers"), returning
    /// the last observed update counter per `(group, partition)`.
    ///
    /// Entries are dispatched onto `executor` and are only guaranteed to
    /// have run once the caller drains it with `executor.shutdown().await`;
    /// this method does not drain the executor itself, so the returned map
    /// must not be read until after shutdown. Any per-entry apply failure
    /// trips `ctx`'s error latch from inside the dispatched job (it can't
    /// surface through this method's return value, since the job may not
    /// have run yet when `apply` returns) — the caller must check
    /// `ctx.error()` after draining the executor.
    pub async fn apply(
        &self,
        ctx: &Arc<RestoreContext>,
        snapshot_name: &str,
        folder_name: &str,
        incremental_index: u32,
        target_groups: &BTreeSet<GroupId>,
        executor: &StripedExecutor,
    ) -> Result<Arc<DashMap<(GroupId, PartitionId), u64>>> {
        let counters: Arc<DashMap<(GroupId, PartitionId), u64>> = Arc::new(DashMap::new());

        let mut all_segments = Vec::new();
        for index in 1..=incremental_index {
            let dir = self.layout.increment_dir(snapshot_name, folder_name, index);
            let segments = self.reader.list_segments(&dir)?;
            all_segments.extend(segments);
        }
        ctx.set_total_wal_segments(all_segments.len() as u64);

        for segment in &all_segments {
            if ctx.should_stop() {
                return Err(RestoreError::Interrupted(
                    "restore attempt stopped during incremental apply".into(),
                ));
            }

            let entries = self.reader.read_segment(segment)?;
            debug!(segment = %segment.display(), entries = entries.len(), "read WAL segment");

            for entry in entries {
                if !target_groups.is_empty() && !target_groups.contains(entry.group()) {
                    continue;
                }
                let partition = match entry.partition() {
                    Some(p) => p,
                    None => {
                        let p = self.affinity.partition(entry.group(), entry.key());
                        warn!(group = %entry.group(), partition = p, "WAL entry missing partition id; falling back to affinity");
                        p
                    }
                };
                let key = (entry.group().clone(), partition);
                let applier = Arc::clone(&self.applier);
                let counters = Arc::clone(&counters);
                let ctx_for_fail = Arc::clone(ctx);
                let ctx_counters_key = key.clone();
                let counter_value = entry.update_counter();
                let fail_group = key.0.clone();
                let fail_partition = key.1;

                executor.submit(key, async move {
                    if let Err(e) = applier.apply(entry.as_ref()) {
                        tracing::error!(error = %e, "WAL entry apply failed");
                        ctx_for_fail.fail(RestoreError::Apply {
                            group: fail_group,
                            partition: fail_partition,
                            reason: e.to_string(),
                        });
                        return;
                    }
                    counters.insert(ctx_counters_key, counter_value);
                });
                ctx.wal_entries_applied(1);
            }

            ctx.wal_segment_done();
        }

        Ok(counters)
    }
}

/// Finalize replayed update counters through the cache lifecycle, then
/// force a checkpoint so the replayed state is durable.
pub async fn finalize(
    lifecycle: &dyn crate::cache_ops::CacheLifecycle,
    counters: &std::collections::BTreeMap<(GroupId, PartitionId), u64>,
) -> Result<()> {
    for ((group, partition), counter) in counters {
        lifecycle.set_update_counter(group, *partition, *counter).await?;
    }
    lifecycle.force_checkpoint().await?;
    info!(partitions = counters.len(), "finalized update counters after incremental apply");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::RoundRobinAffinity;
    use crate::cache_ops::RecordingCacheLifecycle;
    use crate::descriptor::SnapshotDescriptor;
    use crate::ids::{NodeId, RequestId};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct FixedEntry {
        group: GroupId,
        partition: Option<PartitionId>,
        counter: u64,
    }

    impl DataEntry for FixedEntry {
        fn group(&self) -> &GroupId {
            &self.group
        }
        fn partition(&self) -> Option<PartitionId> {
            self.partition
        }
        fn key(&self) -> &[u8] {
            b"fixed-entry-key"
        }
        fn update_counter(&self) -> u64 {
            self.counter
        }
    }

    struct FakeReader {
        segments_per_index: BTreeMap<u32, Vec<Vec<(GroupId, PartitionId, u64)>>>,
    }

    impl WalSegmentReader for FakeReader {
        fn list_segments(&self, dir: &Path) -> Result<Vec<PathBuf>> {
            let index: u32 = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            let count = self.segments_per_index.get(&index).map(|s| s.len()).unwrap_or(0);
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
            let entries = self.segments_per_index[&index][seg_idx]
                .iter()
                .map(|(g, p, c)| -> Box<dyn DataEntry> {
                    Box::new(FixedEntry {
                        group: g.clone(),
                        partition: Some(*p),
                        counter: *c,
                    })
                })
                .collect();
            Ok(entries)
        }
    }

    #[tokio::test]
    async fn apply_dispatches_entries_and_tracks_last_counter_per_partition() {
        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let group: GroupId = "orders".into();

        let mut segments_per_index = BTreeMap::new();
        segments_per_index.insert(
            1,
            vec![vec![
                (group.clone(), 0u32, 1u64),
                (group.clone(), 0u32, 2u64),
                (group.clone(), 1u32, 5u64),
            ]],
        );
        let reader = Arc::new(FakeReader { segments_per_index });
        let applier = Arc::new(NoopApplier);
        let affinity = Arc::new(RoundRobinAffinity::new());
        let incremental = IncrementalApplier::new(layout, reader, applier, affinity);

        let ctx = Arc::new(RestoreContext::new(
            RequestId::new(),
            SnapshotDescriptor::with_increment("nightly", 1),
            NodeId::new(),
            Default::default(),
        ));
        let executor = StripedExecutor::new(4);

        let counters = incremental
            .apply(&ctx, "nightly", "db0", 1, &BTreeSet::new(), &executor)
            .await
            .unwrap();
        executor.shutdown().await;

        assert_eq!(counters.get(&(group.clone(), 0)).map(|e| *e.value()), Some(2));
        assert_eq!(counters.get(&(group, 1)).map(|e| *e.value()), Some(5));
        assert_eq!(ctx.metrics().processed_wal_segments, 1);
        assert_eq!(ctx.metrics().processed_wal_entries, 3);
    }

    struct NoopApplier;
    impl EntryApplier for NoopApplier {
        fn apply(&self, _entry: &dyn DataEntry) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFailsApplier;
    impl EntryApplier for AlwaysFailsApplier {
        fn apply(&self, _entry: &dyn DataEntry) -> Result<()> {
            Err(RestoreError::Corruption("entry apply always fails".into()))
        }
    }

    #[tokio::test]
    async fn apply_failure_trips_the_context_error_latch() {
        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let group: GroupId = "orders".into();

        let mut segments_per_index = BTreeMap::new();
        segments_per_index.insert(1, vec![vec![(group.clone(), 0u32, 1u64)]]);
        let reader = Arc::new(FakeReader { segments_per_index });
        let applier = Arc::new(AlwaysFailsApplier);
        let affinity = Arc::new(RoundRobinAffinity::new());
        let incremental = IncrementalApplier::new(layout, reader, applier, affinity);

        let ctx = Arc::new(RestoreContext::new(
            RequestId::new(),
            SnapshotDescriptor::with_increment("nightly", 1),
            NodeId::new(),
            Default::default(),
        ));
        let executor = StripedExecutor::new(4);

        incremental
            .apply(&ctx, "nightly", "db0", 1, &BTreeSet::new(), &executor)
            .await
            .unwrap();
        executor.shutdown().await;

        let err = ctx.error().expect("apply failure should have latched");
        assert!(matches!(*err, RestoreError::Apply { .. }));
    }

    #[tokio::test]
    async fn missing_partition_falls_back_to_affinity_and_still_applies() {
        struct KeyedEntry {
            group: GroupId,
        }
        impl DataEntry for KeyedEntry {
            fn group(&self) -> &GroupId {
                &self.group
            }
            fn partition(&self) -> Option<PartitionId> {
                None
            }
            fn key(&self) -> &[u8] {
                b"order-42"
            }
            fn update_counter(&self) -> u64 {
                9
            }
        }

        struct SingleEntryReader {
            group: GroupId,
        }
        impl WalSegmentReader for SingleEntryReader {
            fn list_segments(&self, dir: &Path) -> Result<Vec<PathBuf>> {
                Ok(vec![dir.join("seg-0.wal")])
            }
            fn read_segment(&self, _path: &Path) -> Result<Vec<Box<dyn DataEntry>>> {
                Ok(vec![Box::new(KeyedEntry {
                    group: self.group.clone(),
                })])
            }
        }

        let dir = tempdir().unwrap();
        let layout = SnapshotLayout::new(dir.path());
        let group: GroupId = "orders".into();
        let affinity = Arc::new(RoundRobinAffinity::new());
        let expected_partition = affinity.partition(&group, b"order-42");

        let reader = Arc::new(SingleEntryReader { group: group.clone() });
        let applier = Arc::new(NoopApplier);
        let incremental = IncrementalApplier::new(layout, reader, applier, affinity);

        let ctx = Arc::new(RestoreContext::new(
            RequestId::new(),
            SnapshotDescriptor::with_increment("nightly", 1),
            NodeId::new(),
            Default::default(),
        ));
        let executor = StripedExecutor::new(4);

        let counters = incremental
            .apply(&ctx, "nightly", "db0", 1, &BTreeSet::new(), &executor)
            .await
            .unwrap();
        executor.shutdown().await;

        assert!(ctx.error().is_none());
        assert_eq!(counters.get(&(group, expected_partition)).map(|e| *e.value()), Some(9));
    }

    #[tokio::test]
    async fn finalize_sets_counters_and_forces_a_checkpoint() {
        let lifecycle = RecordingCacheLifecycle::new();
        let mut counters = BTreeMap::new();
        counters.insert((GroupId::from("orders"), 0u32), 7u64);

        finalize(&lifecycle, &counters).await.unwrap();

        assert_eq!(*lifecycle.counters.lock().get(&(GroupId::from("orders"), 0)).unwrap(), 7);
        assert_eq!(lifecycle.checkpoints.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
