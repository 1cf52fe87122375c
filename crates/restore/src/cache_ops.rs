//! Cache lifecycle contract.
//!
//! Starting, stopping, and checkpointing cache groups is owned by the
//! cache subsystem, not the restore engine (spec §1, out of scope). The
//! engine calls through this trait at `CacheStart`/`CacheStop`/after
//! incremental apply; it never manages cache state directly.

use crate::cache_config::CacheConfig;
use crate::ids::{GroupId, PartitionId};
use async_trait::async_trait;

/// External collaborator that owns cache group start/stop/checkpoint.
#[async_trait]
pub trait CacheLifecycle: Send + Sync {
    /// Start the caches described by `configs`, reading from their final
    /// (post-switch) on-disk directories.
    async fn start_caches(&self, configs: &[CacheConfig]) -> crate::error::Result<()>;

    /// Stop the named cache groups, used when rolling back after
    /// `CacheStart` has already run.
    async fn stop_caches(&self, groups: &[GroupId]) -> crate::error::Result<()>;

    /// Disable WAL writes for `groups` and mark their last checkpoint
    /// inapplicable for a WAL rebalance, so a crash mid-apply can't be
    /// recovered from the WAL that's about to be replaced by replay.
    /// Called once, before the first incremental entry is dispatched.
    async fn disable_wal(&self, groups: &[GroupId]) -> crate::error::Result<()>;

    /// Re-enable WAL for `groups` once incremental replay has finished.
    /// Called after the replayed update counters are finalized.
    async fn enable_wal(&self, groups: &[GroupId]) -> crate::error::Result<()>;

    /// Record the authoritative update counter for `(group, partition)`
    /// after incremental WAL replay, so the cache's own counter reflects
    /// the replayed log position rather than whatever was on disk before.
    async fn set_update_counter(
        &self,
        group: &GroupId,
        partition: PartitionId,
        counter: u64,
    ) -> crate::error::Result<()>;

    /// Force a checkpoint, flushing the post-replay state to disk so a
    /// crash immediately after restore doesn't lose the incremental
    /// apply.
    async fn force_checkpoint(&self) -> crate::error::Result<()>;
}

/// An in-memory `CacheLifecycle` for tests: records calls instead of
/// touching any real cache subsystem.
#[derive(Default)]
pub struct RecordingCacheLifecycle {
    pub started: parking_lot::Mutex<Vec<GroupId>>,
    pub stopped: parking_lot::Mutex<Vec<GroupId>>,
    pub wal_disabled: parking_lot::Mutex<Vec<GroupId>>,
    pub wal_enabled: parking_lot::Mutex<Vec<GroupId>>,
    pub counters: parking_lot::Mutex<std::collections::BTreeMap<(GroupId, PartitionId), u64>>,
    pub checkpoints: std::sync::atomic::AtomicU64,
}

impl RecordingCacheLifecycle {
    /// A fresh recorder with nothing started or stopped yet.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheLifecycle for RecordingCacheLifecycle {
    async fn start_caches(&self, configs: &[CacheConfig]) -> crate::error::Result<()> {
        let mut started = self.started.lock();
        for cfg in configs {
            started.push(cfg.group_id.clone());
        }
        Ok(())
    }

    async fn stop_caches(&self, groups: &[GroupId]) -> crate::error::Result<()> {
        self.stopped.lock().extend(groups.iter().cloned());
        Ok(())
    }

    async fn disable_wal(&self, groups: &[GroupId]) -> crate::error::Result<()> {
        self.wal_disabled.lock().extend(groups.iter().cloned());
        Ok(())
    }

    async fn enable_wal(&self, groups: &[GroupId]) -> crate::error::Result<()> {
        self.wal_enabled.lock().extend(groups.iter().cloned());
        Ok(())
    }

    async fn set_update_counter(
        &self,
        group: &GroupId,
        partition: PartitionId,
        counter: u64,
    ) -> crate::error::Result<()> {
        self.counters.lock().insert((group.clone(), partition), counter);
        Ok(())
    }

    async fn force_checkpoint(&self) -> crate::error::Result<()> {
        self.checkpoints.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}
