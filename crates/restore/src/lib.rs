//! Cluster-coordinated snapshot restore engine.
//!
//! Restores a partitioned, replicated cache cluster from a base snapshot
//! plus an optional incremental WAL chain, coordinating a fixed sequence
//! of phases (Prepare, Preload, CacheStart, optionally IncrementalApply)
//! across every baseline node before any cache is visible to readers.
//! Every external dependency — transport, affinity, cache lifecycle,
//! cache configuration, and the WAL's own wire format — is a trait the
//! integrator implements; this crate owns only the orchestration.

pub mod affinity;
pub mod cache_config;
pub mod cache_ops;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod directory_switch;
pub mod driver;
pub mod error;
pub mod ids;
pub mod layout;
pub mod membership;
pub mod metadata;
pub mod metrics;
pub mod phase;
pub mod staging;
pub mod striped;
pub mod sync_util;
pub mod testing;
pub mod transport;
pub mod wal_apply;
pub mod wire;

pub use cache_config::CacheConfig;
pub use config::RestoreConfig;
pub use context::RestoreContext;
pub use descriptor::SnapshotDescriptor;
pub use driver::{CacheCatalog, CancelTarget, RestoreEngine};
pub use error::{RestoreError, Result};
pub use ids::{CacheId, GroupId, NodeId, PartitionId, RequestId};
pub use membership::{MembershipEvent, MembershipListener};
pub use metrics::RestoreMetrics;
