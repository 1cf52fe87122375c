//! Snapshot file layout (C1).
//!
//! Resolves the on-disk shape of a snapshot directory the engine only
//! ever *reads*: per-group sub-directories, per-partition files named by
//! partition id, the metadata file, and the incremental WAL
//! sub-directories layered on top of a base snapshot.
//!
//! This module never writes a base snapshot; it only computes paths and
//! enumerates what's already there, matching the spec's "consumes
//! finished snapshot files" boundary.

use crate::ids::{GroupId, PartitionId, INDEX_PARTITION};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const METADATA_FILE_NAME: &str = "metadata.bin";
const MARSHALLER_DIR_NAME: &str = "marshaller";
const INDEX_PARTITION_FILE: &str = "part-index.bin";

/// Resolves paths within a single node's snapshot directory tree.
///
/// A node's snapshot root is `<snapshots_root>/<snapshot_name>/<folder_name>/<consistent_id>`,
/// matching the spec's `(snapshotName, folderName, consistentId)` rooting.
#[derive(Debug, Clone)]
pub struct SnapshotLayout {
    snapshots_root: PathBuf,
}

impl SnapshotLayout {
    /// Create a layout rooted at the given snapshots directory.
    pub fn new(snapshots_root: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_root: snapshots_root.into(),
        }
    }

    /// Root directory for one node's copy of a named snapshot.
    pub fn node_snapshot_dir(
        &self,
        snapshot_name: &str,
        folder_name: &str,
        consistent_id: &str,
    ) -> PathBuf {
        self.snapshots_root
            .join(snapshot_name)
            .join(folder_name)
            .join(consistent_id)
    }

    /// Metadata file path within a node's snapshot directory.
    pub fn metadata_file(&self, node_snapshot_dir: &Path) -> PathBuf {
        node_snapshot_dir.join(METADATA_FILE_NAME)
    }

    /// Marshaller-mapping directory within a node's snapshot directory.
    pub fn marshaller_dir(&self, node_snapshot_dir: &Path) -> PathBuf {
        node_snapshot_dir.join(MARSHALLER_DIR_NAME)
    }

    /// Sub-directory for one cache group within a node's snapshot directory.
    pub fn group_dir(&self, node_snapshot_dir: &Path, group: &GroupId) -> PathBuf {
        node_snapshot_dir.join(&group.0)
    }

    /// Path to a single partition file within a group's directory.
    /// `INDEX_PARTITION` resolves to the group's index-partition file.
    pub fn partition_file(&self, group_dir: &Path, part_id: PartitionId) -> PathBuf {
        if part_id == INDEX_PARTITION {
            group_dir.join(INDEX_PARTITION_FILE)
        } else {
            group_dir.join(format!("part-{part_id}.bin"))
        }
    }

    /// True if `part_id` names the index partition.
    pub fn is_index_partition(part_id: PartitionId) -> bool {
        part_id == INDEX_PARTITION
    }

    /// Root directory for the `index`-th incremental snapshot, layered
    /// alongside (not inside) the base snapshot directory: incremental
    /// directories are numbered `1..=incremental_index` siblings of the
    /// base snapshot's folder.
    pub fn increment_dir(&self, snapshot_name: &str, folder_name: &str, index: u32) -> PathBuf {
        self.snapshots_root
            .join(snapshot_name)
            .join(format!("{folder_name}_incremental"))
            .join(index.to_string())
    }

    /// Enumerate the cache-group sub-directories present under a node's
    /// snapshot directory. Skips the marshaller directory and any
    /// non-directory entries. Order is not guaranteed; callers that need
    /// determinism should sort.
    pub fn list_group_dirs(&self, node_snapshot_dir: &Path) -> io::Result<Vec<GroupId>> {
        let mut groups = Vec::new();
        let entries = match fs::read_dir(node_snapshot_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == MARSHALLER_DIR_NAME {
                continue;
            }
            groups.push(GroupId(name.into_owned()));
        }
        Ok(groups)
    }

    /// Enumerate `(partitionId, path)` pairs present in a group's
    /// directory, including the index partition if present.
    pub fn list_partition_files(
        &self,
        group_dir: &Path,
    ) -> io::Result<Vec<(PartitionId, PathBuf)>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(group_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = parse_partition_file_name(&name) {
                files.push((id, entry.path()));
            }
        }
        files.sort_by_key(|(id, _)| *id);
        Ok(files)
    }
}

fn parse_partition_file_name(name: &str) -> Option<PartitionId> {
    if name == INDEX_PARTITION_FILE {
        return Some(INDEX_PARTITION);
    }
    name.strip_prefix("part-")
        .and_then(|rest| rest.strip_suffix(".bin"))
        .and_then(|id| id.parse::<PartitionId>().ok())
}
