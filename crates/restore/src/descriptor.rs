//! Snapshot descriptor: the immutable "what to restore" the caller supplies.

use std::path::PathBuf;

/// Identifies the snapshot (and optional incremental chain position) a
/// restore attempt targets. Immutable for the life of the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    /// Name of the snapshot, as passed by the caller.
    pub snapshot_name: String,
    /// Optional root path override; when absent, the engine resolves the
    /// default snapshot root via `SnapshotLayout`.
    pub snapshot_path: Option<PathBuf>,
    /// Optional incremental index. `None` or `Some(0)` both mean "no
    /// incremental chain"; indices are 1-based.
    pub incremental_index: Option<u32>,
}

impl SnapshotDescriptor {
    /// Create a descriptor for a base-snapshot-only restore.
    pub fn base(snapshot_name: impl Into<String>) -> Self {
        Self {
            snapshot_name: snapshot_name.into(),
            snapshot_path: None,
            incremental_index: None,
        }
    }

    /// Create a descriptor that also replays an incremental chain up to
    /// (and including) `index`.
    pub fn with_increment(snapshot_name: impl Into<String>, index: u32) -> Self {
        Self {
            snapshot_name: snapshot_name.into(),
            snapshot_path: None,
            incremental_index: Some(index),
        }
    }

    /// Override the snapshot root path (instead of the default layout).
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// The effective incremental index, 0 meaning "no increment".
    pub fn incremental_index(&self) -> u32 {
        self.incremental_index.unwrap_or(0)
    }

    /// True if an incremental chain must be replayed after staging.
    pub fn has_increment(&self) -> bool {
        self.incremental_index() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_descriptor_has_no_increment() {
        let d = SnapshotDescriptor::base("nightly-2026-07-27");
        assert!(!d.has_increment());
        assert_eq!(d.incremental_index(), 0);
    }

    #[test]
    fn with_increment_reports_index() {
        let d = SnapshotDescriptor::with_increment("nightly", 2);
        assert!(d.has_increment());
        assert_eq!(d.incremental_index(), 2);
    }

    #[test]
    fn zero_increment_is_treated_as_none() {
        let d = SnapshotDescriptor {
            snapshot_name: "x".into(),
            snapshot_path: None,
            incremental_index: Some(0),
        };
        assert!(!d.has_increment());
    }
}
