//! Phase state machine (C5 support type).
//!
//! The distributed protocol advances through a fixed sequence of
//! phases; each one runs a local step on every required node, then
//! waits for every node to finish before the coordinator advances the
//! whole cluster. `IncrementalApply` only runs when the descriptor asks
//! for an incremental chain to be replayed on top of the base snapshot.

use std::fmt;

/// One step of the restore protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Verify preconditions, collect metadata and cache configs.
    Prepare,
    /// Stage partition files into a temporary directory per group.
    Preload,
    /// Atomically switch staged directories into place and start caches.
    CacheStart,
    /// Replay the incremental WAL chain on top of the base snapshot.
    IncrementalApply,
    /// Stop caches that were already started, as part of rolling back.
    CacheStop,
    /// Undo partial work and leave the node in its pre-attempt state.
    Rollback,
}

impl Phase {
    /// The ordered forward sequence of phases for an attempt with no
    /// incremental chain to replay.
    pub const BASE_SEQUENCE: [Phase; 3] = [Phase::Prepare, Phase::Preload, Phase::CacheStart];

    /// The ordered forward sequence including incremental apply.
    pub const INCREMENTAL_SEQUENCE: [Phase; 4] = [
        Phase::Prepare,
        Phase::Preload,
        Phase::CacheStart,
        Phase::IncrementalApply,
    ];

    /// The phase sequence this attempt should run, given whether an
    /// incremental chain needs replaying.
    pub fn sequence_for(has_increment: bool) -> &'static [Phase] {
        if has_increment {
            &Self::INCREMENTAL_SEQUENCE
        } else {
            &Self::BASE_SEQUENCE
        }
    }

    /// True if reaching this phase means local caches may already be running,
    /// so a failure from here on must run `CacheStop` before `Rollback`.
    pub fn caches_may_be_running(self) -> bool {
        matches!(self, Phase::CacheStart | Phase::IncrementalApply)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Prepare => "Prepare",
            Phase::Preload => "Preload",
            Phase::CacheStart => "CacheStart",
            Phase::IncrementalApply => "IncrementalApply",
            Phase::CacheStop => "CacheStop",
            Phase::Rollback => "Rollback",
        };
        f.write_str(name)
    }
}

/// A single phase's local behavior. The driver (C5) calls `local_step`
/// on every required node, collects the results through the transport
/// layer, then calls `finish` once on the coordinator after every node
/// has reported in.
#[async_trait::async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Which phase this handler implements.
    fn phase(&self) -> Phase;

    /// Run this node's local slice of the phase. Returning `Err` trips
    /// the attempt's error latch; the driver still runs `finish` for
    /// bookkeeping, but the next phase never starts.
    async fn local_step(&self) -> crate::error::Result<()>;

    /// Run once, after every required node's `local_step` has completed
    /// (or after the first failure, for cleanup purposes). Only called
    /// on the coordinator node.
    async fn finish(&self, failed: bool) -> crate::error::Result<()> {
        let _ = failed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_sequence_excludes_incremental_apply() {
        assert!(!Phase::sequence_for(false).contains(&Phase::IncrementalApply));
    }

    #[test]
    fn incremental_sequence_includes_incremental_apply() {
        assert!(Phase::sequence_for(true).contains(&Phase::IncrementalApply));
    }

    #[test]
    fn caches_may_be_running_only_from_cache_start_onward() {
        assert!(!Phase::Prepare.caches_may_be_running());
        assert!(!Phase::Preload.caches_may_be_running());
        assert!(Phase::CacheStart.caches_may_be_running());
        assert!(Phase::IncrementalApply.caches_may_be_running());
    }

    #[test]
    fn display_matches_phase_name() {
        assert_eq!(Phase::CacheStart.to_string(), "CacheStart");
    }
}
