//! Restore metrics snapshot (C8).
//!
//! A point-in-time read of one attempt's progress, meant to be polled by
//! whatever metrics/observability surface the integrator wires up (JMX,
//! Prometheus, a status RPC — the registry itself is an external
//! collaborator, same as the transport and affinity layers).

use crate::ids::RequestId;
use std::time::SystemTime;

/// Snapshot of one restore attempt's progress and outcome.
#[derive(Debug, Clone)]
pub struct RestoreMetrics {
    /// Attempt id.
    pub request_id: RequestId,
    /// Name of the snapshot being restored.
    pub snapshot_name: String,
    /// 0 if no incremental chain is being replayed.
    pub incremental_index: u32,
    /// When the attempt started.
    pub started_at: SystemTime,
    /// When the attempt finished, if it has.
    pub ended_at: Option<SystemTime>,
    /// The latched error's message, if the attempt failed.
    pub error: Option<String>,
    /// Total partitions the staging plan needs to place.
    pub total_partitions: u64,
    /// Partitions staged so far.
    pub processed_partitions: u64,
    /// Total WAL segments in the incremental chain being replayed.
    pub total_wal_segments: u64,
    /// WAL segments replayed so far.
    pub processed_wal_segments: u64,
    /// WAL entries applied so far, across all striped workers.
    pub processed_wal_entries: u64,
}

impl RestoreMetrics {
    /// True if the attempt has finished (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// True if the attempt finished with an error.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Fraction of partitions staged so far, `0.0` if none are expected yet.
    pub fn partition_progress(&self) -> f64 {
        if self.total_partitions == 0 {
            return 0.0;
        }
        self.processed_partitions as f64 / self.total_partitions as f64
    }
}
