//! Snapshot metadata registry (C2).
//!
//! Reads and validates the per-node metadata file the snapshot creator
//! left behind: page size, baseline node set, which partitions of which
//! group this node's snapshot directory actually contains, and the
//! `onlyPrimary` / per-group compression flags. The engine never writes
//! this file — only reads and cross-checks it.
//!
//! On-disk framing follows the same magic + version + CRC32 shape the
//! durability crate's disk-snapshot header uses, msgpack body instead of
//! a fixed-width struct since the partition-set map is variable-length.

use crate::ids::{GroupId, NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;

const METADATA_MAGIC: [u8; 4] = *b"RSTM";
const METADATA_FORMAT_VERSION: u16 = 1;

/// Per-node snapshot metadata: one instance per `(node, snapshot)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// The node this metadata describes.
    pub node_id: NodeId,
    /// Storage page size in bytes; must match across all metadata in one attempt.
    pub page_size: u32,
    /// Stable on-disk identifier for this node at snapshot time.
    pub consistent_id: String,
    /// Directory name this node's files live under.
    pub folder_name: String,
    /// The baseline node set recorded at snapshot time.
    pub baseline: BTreeSet<NodeId>,
    /// Partitions this node's snapshot directory holds, per group.
    pub partitions: BTreeMap<GroupId, BTreeSet<PartitionId>>,
    /// True if only primary-owned partitions were snapshotted (no backups).
    pub only_primary: bool,
    /// Groups whose pages are compressed (and thus hole-punch eligible).
    pub compressed_groups: BTreeSet<GroupId>,
}

impl SnapshotMetadata {
    /// Partitions available for `group` on this node (empty set if the
    /// group isn't present in this metadata at all).
    pub fn partitions_for(&self, group: &GroupId) -> BTreeSet<PartitionId> {
        self.partitions.get(group).cloned().unwrap_or_default()
    }

    /// True if `group` is compressed and hence eligible for hole-punching.
    pub fn is_compressed(&self, group: &GroupId) -> bool {
        self.compressed_groups.contains(group)
    }

    /// Serialize to the framed on-disk/wire byte format.
    pub fn to_bytes(&self) -> MetadataResult<Vec<u8>> {
        let body = rmp_serde::to_vec(self).map_err(|e| MetadataError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(4 + 2 + body.len() + 4);
        out.extend_from_slice(&METADATA_MAGIC);
        out.extend_from_slice(&METADATA_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(out)
    }

    /// Parse from the framed byte format, validating magic, version, and CRC.
    pub fn from_bytes(data: &[u8]) -> MetadataResult<Self> {
        if data.len() < 4 + 2 + 4 {
            return Err(MetadataError::TooSmall { size: data.len() });
        }
        let (header, rest) = data.split_at(6);
        let magic: [u8; 4] = header[0..4].try_into().unwrap();
        if magic != METADATA_MAGIC {
            return Err(MetadataError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if version != METADATA_FORMAT_VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }

        let (body, crc_bytes) = rest.split_at(rest.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header);
        hasher.update(body);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(MetadataError::CrcMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }

        rmp_serde::from_slice(body).map_err(|e| MetadataError::Decode(e.to_string()))
    }

    /// Read the metadata file at `path`.
    pub fn read_from(path: &Path) -> MetadataResult<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Self::from_bytes(&data)
    }

    /// Write the metadata file at `path` (used only by test fixtures —
    /// the engine never produces a snapshot's metadata in production).
    pub fn write_to(&self, path: &Path) -> MetadataResult<()> {
        let bytes = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

/// Result alias for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Errors reading or validating a metadata file.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// File too small to contain a valid header + CRC.
    #[error("metadata file too small: {size} bytes")]
    TooSmall {
        /// Observed size.
        size: usize,
    },
    /// Magic bytes didn't match.
    #[error("invalid metadata magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),
    /// Format version newer than this build understands.
    #[error("unsupported metadata format version: {0}")]
    UnsupportedVersion(u16),
    /// CRC32 over header+body didn't match the trailer.
    #[error("metadata CRC mismatch: stored={stored:#010x}, computed={computed:#010x}")]
    CrcMismatch {
        /// CRC stored in the trailer.
        stored: u32,
        /// CRC computed from the file contents.
        computed: u32,
    },
    /// msgpack encode failure.
    #[error("failed to encode metadata: {0}")]
    Encode(String),
    /// msgpack decode failure.
    #[error("failed to decode metadata: {0}")]
    Decode(String),
    /// Underlying I/O failure.
    #[error("I/O error reading metadata: {0}")]
    Io(#[from] io::Error),
}

/// Cross-checks invariants that must hold across *all* metadata
/// collected for one restore attempt (one per participating node).
///
/// Returns the authoritative `only_primary` flag on success.
pub fn validate_metadata_set(
    metas: &[SnapshotMetadata],
    requested_groups: Option<&BTreeSet<GroupId>>,
) -> Result<bool, String> {
    let first = metas.first().ok_or("no snapshot metadata collected")?;
    let page_size = first.page_size;
    let only_primary = first.only_primary;

    for m in metas.iter().skip(1) {
        if m.page_size != page_size {
            return Err(format!(
                "page size mismatch: {} declared {}, {} declared {}",
                first.node_id, page_size, m.node_id, m.page_size
            ));
        }
        if m.only_primary != only_primary {
            return Err(format!(
                "onlyPrimary mismatch: {} declared {}, {} declared {}",
                first.node_id, only_primary, m.node_id, m.only_primary
            ));
        }
    }

    if let Some(requested) = requested_groups {
        let available: BTreeSet<&GroupId> = metas.iter().flat_map(|m| m.partitions.keys()).collect();
        for group in requested {
            if !available.contains(group) {
                return Err(format!("no snapshot data for {group}"));
            }
        }
    }

    Ok(only_primary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotMetadata {
        let mut partitions = BTreeMap::new();
        partitions.insert(GroupId::from("orders"), BTreeSet::from([0, 1, 2]));
        SnapshotMetadata {
            node_id: NodeId::new(),
            page_size: 4096,
            consistent_id: "node-a".into(),
            folder_name: "db0".into(),
            baseline: BTreeSet::new(),
            partitions,
            only_primary: false,
            compressed_groups: BTreeSet::new(),
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let meta = sample();
        let bytes = meta.to_bytes().unwrap();
        let decoded = SnapshotMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            SnapshotMetadata::from_bytes(&bytes),
            Err(MetadataError::InvalidMagic(_))
        ));
    }

    #[test]
    fn rejects_crc_mismatch() {
        let mut bytes = sample().to_bytes().unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            SnapshotMetadata::from_bytes(&bytes),
            Err(MetadataError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn read_write_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.bin");
        let meta = sample();
        meta.write_to(&path).unwrap();
        let loaded = SnapshotMetadata::read_from(&path).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn validate_set_detects_page_size_mismatch() {
        let mut a = sample();
        a.page_size = 4096;
        let mut b = sample();
        b.page_size = 8192;
        let err = validate_metadata_set(&[a, b], None).unwrap_err();
        assert!(err.contains("page size mismatch"));
    }

    #[test]
    fn validate_set_detects_only_primary_mismatch() {
        let mut a = sample();
        a.only_primary = true;
        let mut b = sample();
        b.only_primary = false;
        let err = validate_metadata_set(&[a, b], None).unwrap_err();
        assert!(err.contains("onlyPrimary mismatch"));
    }

    #[test]
    fn validate_set_rejects_missing_group() {
        let a = sample();
        let requested = BTreeSet::from([GroupId::from("orders"), GroupId::from("users")]);
        let err = validate_metadata_set(&[a], Some(&requested)).unwrap_err();
        assert!(err.contains("no snapshot data for users"));
    }

    #[test]
    fn validate_set_accepts_consistent_metadata() {
        let a = sample();
        let requested = BTreeSet::from([GroupId::from("orders")]);
        let only_primary = validate_metadata_set(&[a], Some(&requested)).unwrap();
        assert!(!only_primary);
    }
}
