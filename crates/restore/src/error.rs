//! Unified error type for the restore engine.
//!
//! Every public operation returns `Result<T>`. Variants map 1:1 onto the
//! error kinds the distributed phase driver distinguishes between, so a
//! caller can match on *kind* without string-parsing a message.

use crate::ids::{GroupId, NodeId, PartitionId, RequestId};
use std::io;
use thiserror::Error;

/// Result alias for the restore engine.
pub type Result<T> = std::result::Result<T, RestoreError>;

/// Errors produced by the restore engine.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// A precondition for `start` failed before any phase ran.
    #[error("restore rejected: {reason}")]
    Rejected {
        /// Human-readable reason.
        reason: String,
    },

    /// Snapshot metadata was missing, inconsistent, or didn't cover a
    /// requested group.
    #[error("invalid snapshot metadata: {0}")]
    InvalidMetadata(String),

    /// A Prepare-phase precondition on the local filesystem failed
    /// (existing cache, non-empty target dir, stale temp dir, etc).
    #[error("restore precondition failed: {0}")]
    Precondition(String),

    /// A required baseline node left the cluster mid-attempt.
    #[error("required node {node} left during restore of {request_id}")]
    RequiredNodeLeft {
        /// The node that left.
        node: NodeId,
        /// The attempt it was required for.
        request_id: RequestId,
    },

    /// The attempt was interrupted, either by `cancel` or because the
    /// local node is stopping.
    #[error("restore interrupted: {0}")]
    Interrupted(String),

    /// A filesystem operation (copy, rename, hole-punch, delete) failed.
    #[error("I/O error during restore: {0}")]
    Io(#[from] io::Error),

    /// Applying a WAL entry, or forcing the post-apply checkpoint, failed.
    #[error("incremental apply failed for group {group} partition {partition}: {reason}")]
    Apply {
        /// The group being applied.
        group: GroupId,
        /// The partition being applied.
        partition: PartitionId,
        /// Why it failed.
        reason: String,
    },

    /// A peer refused or failed to supply a requested partition file.
    #[error("remote fetch of group {group} partition {partition} from {from} failed: {reason}")]
    RemoteFetch {
        /// The peer that was asked.
        from: NodeId,
        /// The group being fetched.
        group: GroupId,
        /// The partition being fetched.
        partition: PartitionId,
        /// Why it failed.
        reason: String,
    },

    /// A phase message round-trip with a peer failed at the transport
    /// level (distinct from `RemoteFetch`, which is a data-plane failure
    /// reported by a healthy peer).
    #[error("transport error talking to {node}: {reason}")]
    Transport {
        /// The peer that could not be reached.
        node: NodeId,
        /// Why it failed.
        reason: String,
    },

    /// The on-disk or wire metadata framing failed validation (magic,
    /// CRC, or codec mismatch).
    #[error("corrupt restore metadata: {0}")]
    Corruption(String),
}

impl Clone for RestoreError {
    /// `io::Error` isn't `Clone`, so the `Io` variant is rebuilt from its
    /// kind and message instead of cloned verbatim. The driver needs this
    /// to hand the same latched failure back from both `start()`'s return
    /// value and any concurrent `cancel()`/`wait_finished()` caller.
    fn clone(&self) -> Self {
        match self {
            RestoreError::Rejected { reason } => RestoreError::Rejected { reason: reason.clone() },
            RestoreError::InvalidMetadata(s) => RestoreError::InvalidMetadata(s.clone()),
            RestoreError::Precondition(s) => RestoreError::Precondition(s.clone()),
            RestoreError::RequiredNodeLeft { node, request_id } => RestoreError::RequiredNodeLeft {
                node: *node,
                request_id: *request_id,
            },
            RestoreError::Interrupted(s) => RestoreError::Interrupted(s.clone()),
            RestoreError::Io(e) => RestoreError::Io(io::Error::new(e.kind(), e.to_string())),
            RestoreError::Apply { group, partition, reason } => RestoreError::Apply {
                group: group.clone(),
                partition: *partition,
                reason: reason.clone(),
            },
            RestoreError::RemoteFetch { from, group, partition, reason } => RestoreError::RemoteFetch {
                from: *from,
                group: group.clone(),
                partition: *partition,
                reason: reason.clone(),
            },
            RestoreError::Transport { node, reason } => RestoreError::Transport {
                node: *node,
                reason: reason.clone(),
            },
            RestoreError::Corruption(s) => RestoreError::Corruption(s.clone()),
        }
    }
}

impl RestoreError {
    /// Construct a `Rejected` error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        RestoreError::Rejected {
            reason: reason.into(),
        }
    }

    /// Construct an `InvalidMetadata` error.
    pub fn invalid_metadata(reason: impl Into<String>) -> Self {
        RestoreError::InvalidMetadata(reason.into())
    }

    /// Construct a `Precondition` error.
    pub fn precondition(reason: impl Into<String>) -> Self {
        RestoreError::Precondition(reason.into())
    }

    /// True if this error kind should cause the driver to run the
    /// `CacheStop` step before `Rollback` (i.e. it was raised at or after
    /// the `CacheStart` phase, when caches may already be running).
    pub fn requires_cache_stop(&self) -> bool {
        matches!(
            self,
            RestoreError::Apply { .. } | RestoreError::RequiredNodeLeft { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_message_contains_reason() {
        let err = RestoreError::rejected("client node cannot initiate restore");
        assert!(err.to_string().contains("client node cannot initiate"));
    }

    #[test]
    fn required_node_left_formats_both_ids() {
        let node = NodeId::new();
        let request_id = RequestId::new();
        let err = RestoreError::RequiredNodeLeft { node, request_id };
        let msg = err.to_string();
        assert!(msg.contains(&node.to_string()));
        assert!(msg.contains(&request_id.to_string()));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing partition file");
        let err: RestoreError = io_err.into();
        assert!(matches!(err, RestoreError::Io(_)));
    }

    #[test]
    fn clone_preserves_variant_and_message() {
        let err = RestoreError::RequiredNodeLeft {
            node: NodeId::new(),
            request_id: RequestId::new(),
        };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());

        let io_err = RestoreError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let cloned_io = io_err.clone();
        assert!(matches!(cloned_io, RestoreError::Io(_)));
        assert_eq!(io_err.to_string(), cloned_io.to_string());
    }
}
