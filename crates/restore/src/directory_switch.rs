//! Atomic directory switch (C7).
//!
//! Staging writes every group into a temp directory beside its final
//! location, never into the final location directly. Once every group
//! for an attempt has staged cleanly, the switch step renames each temp
//! directory onto its final path; on any failure it deletes both the
//! temp and (if already switched) the final directory so the node is
//! left either fully pre-attempt or fully post-attempt, never in
//! between. Same temp-then-rename-then-cleanup-on-failure shape as
//! `durability::branch_bundle::writer::BranchBundleWriter::write`.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One group's temp-to-final switch.
#[derive(Debug, Clone)]
pub struct SwitchStep {
    /// Directory staging wrote into.
    pub staged_dir: PathBuf,
    /// Directory the group should live at once the switch commits.
    pub final_dir: PathBuf,
}

/// Commits every switch step, or rolls every one of them back.
///
/// Renames are attempted in order; if any rename fails, every step
/// already committed is rolled back (its final dir removed) and every
/// step not yet reached has its staged dir removed, so the attempt
/// leaves no partial final state behind.
pub fn commit_all(steps: &[SwitchStep]) -> Result<()> {
    let mut committed = Vec::with_capacity(steps.len());

    for step in steps {
        match commit_one(step) {
            Ok(()) => committed.push(step),
            Err(e) => {
                warn!(
                    staged = %step.staged_dir.display(),
                    final_dir = %step.final_dir.display(),
                    error = %e,
                    "directory switch failed; rolling back this attempt's switches"
                );
                rollback(&committed, &steps[committed.len() + 1..]);
                return Err(e);
            }
        }
    }

    info!(groups = steps.len(), "directory switch committed for all groups");
    Ok(())
}

fn commit_one(step: &SwitchStep) -> Result<()> {
    if let Some(parent) = step.final_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    if step.final_dir.exists() {
        fs::remove_dir_all(&step.final_dir)?;
    }
    fs::rename(&step.staged_dir, &step.final_dir)?;
    Ok(())
}

/// Delete both sides of every step: the final dir for already-committed
/// steps, the staged dir for steps that never got renamed.
fn rollback(committed: &[&SwitchStep], uncommitted: &[SwitchStep]) {
    for step in committed {
        if let Err(e) = fs::remove_dir_all(&step.final_dir) {
            warn!(dir = %step.final_dir.display(), error = %e, "failed to roll back committed switch");
        }
    }
    for step in uncommitted {
        if step.staged_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&step.staged_dir) {
                warn!(dir = %step.staged_dir.display(), error = %e, "failed to clean up staged directory");
            }
        }
    }
}

/// Roll back every step regardless of commit state, used when the
/// attempt fails for reasons unrelated to the switch itself (e.g. a
/// required node left during Preload, before any switch was attempted).
pub fn rollback_all(steps: &[SwitchStep]) {
    for step in steps {
        if step.final_dir.exists() {
            let _ = fs::remove_dir_all(&step.final_dir);
        }
        if step.staged_dir.exists() {
            let _ = fs::remove_dir_all(&step.staged_dir);
        }
    }
}

/// Staging temp directory for a group, siblinged next to its final
/// location so the rename is same-filesystem (and hence atomic).
pub fn staging_dir_for(final_dir: &Path) -> PathBuf {
    let file_name = final_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_dir.with_file_name(format!("{file_name}.restoring"))
}
