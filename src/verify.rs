//! Pinned external data and its verification.
//!
//! Results repositories can depend on data produced elsewhere: other result
//! repositories, or this project's own earlier branches. Each dependency is
//! pinned to an exact commit in a manifest committed alongside the results,
//! and verified before anything is published on top of it.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::TrackError;
use crate::repo::{Project, RepositoryHandle};
use crate::util;

/// Manifest file at the results repository root.
pub const CACHE_MANIFEST_FILE: &str = ".runtrack-cache.json";

/// Source URL this project's own result branches are pinned under.
pub const SELF_SOURCE: &str = "self";

/// One pinned dependency: where it came from and the exact commit it must
/// stay at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedEntry {
    pub source: String,
    pub branch: String,
    pub commit: String,
}

/// Relative target path -> pinned entry, kept sorted for stable diffs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheManifest {
    #[serde(flatten)]
    entries: BTreeMap<String, PinnedEntry>,
}

impl CacheManifest {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse cache manifest {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize cache manifest")?;
        std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, target: &str) -> Option<&PinnedEntry> {
        self.entries.get(target)
    }

    pub fn insert(&mut self, target: String, entry: PinnedEntry) {
        self.entries.insert(target, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PinnedEntry)> {
        self.entries.iter()
    }
}

/// Pins, verifies, and re-materializes external data inside one project's
/// results tree.
#[derive(Debug)]
pub struct ExternalCacheVerifier<'a> {
    project: &'a Project,
}

impl<'a> ExternalCacheVerifier<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    fn manifest_path(&self) -> PathBuf {
        self.project.results().path().join(CACHE_MANIFEST_FILE)
    }

    pub fn manifest(&self) -> Result<CacheManifest> {
        CacheManifest::load(&self.manifest_path())
    }

    /// Clones `branch` of `source` into `target` (relative to the results
    /// repository) and records the resolved commit in the manifest. The
    /// target is git-ignored so the pinned tree never enters the results
    /// history itself.
    pub fn pin(&self, source: &str, branch: &str, target: &str) -> Result<PinnedEntry> {
        let results = self.project.results();
        let target_path = results.path().join(target);
        if target_path.exists() {
            return Err(anyhow!(
                "import target {} already exists",
                target_path.display()
            ));
        }
        results
            .git()
            .clone_filtered(source, Some(branch), &target_path)
            .with_context(|| format!("pin {source}@{branch} into {target}"))?;
        let pinned = RepositoryHandle::open_with(results.git().clone(), &target_path)?;
        let commit = pinned.current_commit_hash()?;

        util::append_line(&results.path().join(".gitignore"), target)?;
        let mut manifest = self.manifest()?;
        let entry = PinnedEntry {
            source: source.to_string(),
            branch: branch.to_string(),
            commit: commit.clone(),
        };
        manifest.insert(target.to_string(), entry.clone());
        manifest.save(&self.manifest_path())?;
        tracing::info!(source, branch, commit, target, "pinned external data");
        Ok(entry)
    }

    /// Checks every pinned entry against its recorded commit. Any drift --
    /// a missing directory, a different checked-out commit, or uncommitted
    /// changes inside the pinned tree -- is a hard failure.
    pub fn verify_all(&self) -> Result<()> {
        let manifest = self.manifest()?;
        for (target, entry) in manifest.iter() {
            self.verify_entry(target, entry)?;
        }
        Ok(())
    }

    fn verify_entry(&self, target: &str, entry: &PinnedEntry) -> Result<()> {
        let path = self.project.results().path().join(target);
        if !path.exists() {
            return Err(anyhow!(TrackError::Integrity {
                path,
                reason: "pinned directory is missing".to_string(),
            }));
        }
        let handle = RepositoryHandle::open_with(self.project.results().git().clone(), &path)?;
        let commit = handle.current_commit_hash()?;
        if commit != entry.commit {
            return Err(anyhow!(TrackError::Integrity {
                path,
                reason: format!(
                    "pinned at commit {} but checked out at {}",
                    entry.commit, commit
                ),
            }));
        }
        let status = handle.status_porcelain()?;
        if !status.is_empty() {
            return Err(anyhow!(TrackError::Integrity {
                path,
                reason: format!("pinned tree has uncommitted changes:\n{status}"),
            }));
        }
        Ok(())
    }

    /// Re-materializes missing entries, or every entry when `force` is
    /// set. Entries pinned with source `self` clone from this project's
    /// own results checkout instead of a remote.
    pub fn reload(&self, force: bool) -> Result<()> {
        let manifest = self.manifest()?;
        for (target, entry) in manifest.iter() {
            let path = self.project.results().path().join(target);
            if path.exists() {
                if !force {
                    continue;
                }
                util::remove_path(&path)?;
            }
            self.materialize_entry(target, entry, &path)?;
            self.verify_entry(target, entry)?;
        }
        Ok(())
    }

    fn materialize_entry(&self, target: &str, entry: &PinnedEntry, path: &Path) -> Result<()> {
        tracing::info!(target, branch = %entry.branch, "re-materializing pinned data");
        // `self` entries come from this project's own result branches, so
        // clone from the sibling checkout instead of going to a remote.
        let source = if entry.source == SELF_SOURCE {
            self.project.results().path().to_string_lossy().to_string()
        } else {
            entry.source.clone()
        };
        self.project
            .results()
            .git()
            .clone_filtered(&source, Some(&entry.branch), path)?;
        Ok(())
    }

    /// Deletes every pinned directory, leaving the manifest in place for a
    /// later `reload`.
    pub fn clear(&self) -> Result<()> {
        let manifest = self.manifest()?;
        for (target, _) in manifest.iter() {
            let path = self.project.results().path().join(target);
            if path.exists() {
                tracing::info!(target, "removing pinned data");
                util::remove_path(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_entries_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_MANIFEST_FILE);

        let mut manifest = CacheManifest::default();
        manifest.insert(
            "imports/b".to_string(),
            PinnedEntry {
                source: "https://example.org/b.git".to_string(),
                branch: "main".to_string(),
                commit: "b".repeat(40),
            },
        );
        manifest.insert(
            "imports/a".to_string(),
            PinnedEntry {
                source: SELF_SOURCE.to_string(),
                branch: "2024-01-01_00-00-00_main_abc1234_fghjk".to_string(),
                commit: "a".repeat(40),
            },
        );
        manifest.save(&path).unwrap();

        let reloaded = CacheManifest::load(&path).unwrap();
        let targets: Vec<&String> = reloaded.iter().map(|(target, _)| target).collect();
        assert_eq!(targets, ["imports/a", "imports/b"]);
        assert_eq!(reloaded.get("imports/a").unwrap().source, SELF_SOURCE);
    }

    #[test]
    fn missing_manifest_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = CacheManifest::load(&dir.path().join(CACHE_MANIFEST_FILE)).unwrap();
        assert!(manifest.is_empty());
    }
}
