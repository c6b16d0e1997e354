//! Read-only snapshots of result branches.
//!
//! Result branches live in a single git working directory, so only one can
//! be checked out at a time. Snapshots give analysis code stable,
//! concurrently-readable copies of any branch's tree without touching the
//! results repository's checkout state for longer than the copy takes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::ledger::{RunLedger, LEDGER_FILE_NAME};
use crate::repo::{BranchState, Project};
use crate::util;

/// Materializes and discards per-branch snapshot directories under the
/// project's snapshot root.
#[derive(Debug)]
pub struct SnapshotCache<'a> {
    project: &'a Project,
}

impl<'a> SnapshotCache<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    pub fn root(&self) -> PathBuf {
        self.project.snapshot_root()
    }

    pub fn snapshot_path(&self, branch: &str) -> PathBuf {
        self.root().join(branch)
    }

    /// Materializes a read-only snapshot of `branch` and returns its path.
    ///
    /// Branch trees are immutable once committed, so an existing snapshot
    /// directory is returned untouched. The results repository is restored
    /// to its prior branch (and stash, if any) before returning.
    pub fn materialize(&self, branch: &str) -> Result<PathBuf> {
        let target = self.snapshot_path(branch);
        if target.exists() {
            tracing::debug!(branch, "snapshot already materialized");
            return Ok(target);
        }

        let results = self.project.results();
        let previous = results.current_branch()?;
        let stashed = results.stash_all()?;
        let restore = |cache: &Self| -> Result<()> {
            if let BranchState::Named(name) = &previous {
                cache.project.results().checkout(name)?;
            }
            if stashed {
                cache.project.results().stash_pop()?;
            }
            Ok(())
        };

        let copied = (|| -> Result<()> {
            results.checkout(branch)?;
            std::fs::create_dir_all(self.root())
                .with_context(|| format!("create {}", self.root().display()))?;
            util::copy_tree_excluding_git(results.path(), &target)?;
            Ok(())
        })();

        match copied {
            Ok(()) => {
                restore(self)?;
                util::make_readonly_recursive(&target)?;
                tracing::info!(branch, path = %target.display(), "materialized snapshot");
                Ok(target)
            }
            Err(err) => {
                // Best effort: put the checkout back before reporting.
                if let Err(restore_err) = restore(self) {
                    tracing::warn!(error = %restore_err, "failed to restore results checkout");
                }
                util::remove_path(&target).ok();
                Err(err)
            }
        }
    }

    /// The ledger as recorded on main, read from main's snapshot so the
    /// results checkout can stay on any branch while it is consulted.
    pub fn ledger(&self) -> Result<RunLedger> {
        let main = self.project.results().main_branch().to_string();
        let snapshot = self.materialize(&main)?;
        RunLedger::load(&snapshot.join(LEDGER_FILE_NAME))
    }

    /// Removes the snapshot for `branch` if present.
    pub fn invalidate(&self, branch: &str) -> Result<()> {
        remove_snapshot(&self.snapshot_path(branch))
    }

    /// Removes the entire snapshot root.
    pub fn clear(&self) -> Result<()> {
        remove_snapshot(&self.root())
    }
}

fn remove_snapshot(path: &Path) -> Result<()> {
    if path.exists() {
        tracing::info!(path = %path.display(), "removing snapshot");
    }
    util::remove_path(path)
}
