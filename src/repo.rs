//! Repository handles and the paired code/results project.
//!
//! A [`RepositoryHandle`] is an explicit value bound to one working
//! directory; there are no global repository singletons. The tracking
//! engine holds one handle for the code repository and one for the results
//! repository, paired through the project metadata file.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::errors::TrackError;
use crate::git::GitClient;
use crate::ledger::{LEDGER_FILE_NAME, RUN_HISTORY_DIR};
use crate::util;

/// Project metadata file at the code repository root.
pub const PROJECT_METADATA_FILE: &str = ".runtrack.json";

/// Identity and pairing information for a tracked project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    /// Stable identifier for the project.
    pub project_id: String,
    /// Name of the results repository folder inside the code repository.
    pub results_folder: String,
    /// Remote name to URL mapping for the results repository.
    #[serde(default)]
    pub results_remotes: BTreeMap<String, String>,
}

impl ProjectMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!(
                "read {} (is this a runtrack project?)",
                path.display()
            )
        })?;
        serde_json::from_str(&text).context("parse project metadata JSON")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize project metadata")?;
        std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

/// Where HEAD currently points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    Named(String),
    Detached,
}

impl BranchState {
    pub fn name(&self) -> Option<&str> {
        match self {
            BranchState::Named(name) => Some(name),
            BranchState::Detached => None,
        }
    }
}

/// Result of a commit attempt. Cancellation is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { hash: String },
    NothingToCommit,
    Cancelled,
}

/// Guard mode for destructive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Ask on stdin before proceeding.
    Prompt,
    /// Proceed unconditionally (unattended use).
    Force,
}

/// Result of a guarded hard reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset,
    Cancelled,
}

/// One git working directory and the high-level operations the engine
/// issues against it.
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
    git: GitClient,
    root: PathBuf,
    main_branch: String,
}

impl RepositoryHandle {
    /// Opens the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let git = GitClient::locate()?;
        Self::open_with(git, path)
    }

    pub fn open_with(git: GitClient, path: &Path) -> Result<Self> {
        let top = git
            .run(path, &["rev-parse", "--show-toplevel"])
            .with_context(|| format!("{} is not inside a git repository", path.display()))?;
        let root = PathBuf::from(top);
        let main_branch = detect_main_branch(&git, &root)?;
        Ok(Self {
            git,
            root,
            main_branch,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> &GitClient {
        &self.git
    }

    /// Name of the trunk branch: `main`, or `master` in repositories that
    /// only have a `master`.
    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    pub fn current_branch(&self) -> Result<BranchState> {
        let name = self
            .git
            .run(&self.root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if name == "HEAD" {
            Ok(BranchState::Detached)
        } else {
            Ok(BranchState::Named(name))
        }
    }

    pub fn current_commit_hash(&self) -> Result<String> {
        self.git.run(&self.root, &["rev-parse", "HEAD"])
    }

    pub fn short_commit_hash(&self) -> Result<String> {
        self.git
            .run(&self.root, &["rev-parse", "--short=7", "HEAD"])
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.git.run(&self.root, &["rev-parse", rev])
    }

    /// Porcelain status text; empty means clean.
    pub fn status_porcelain(&self) -> Result<String> {
        self.git.run(&self.root, &["status", "--porcelain"])
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Fails with [`TrackError::DirtyState`] unless the tree is clean.
    pub fn require_clean(&self) -> Result<()> {
        let status = self.status_porcelain()?;
        if status.is_empty() {
            return Ok(());
        }
        Err(anyhow!(TrackError::DirtyState {
            repo: self.root.clone(),
            details: status,
        }))
    }

    /// Tracked files with unstaged modifications.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        let listing = self.git.run(&self.root, &["diff", "--name-only"])?;
        Ok(listing
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Files not yet known to git, honoring ignore rules.
    pub fn untracked_files(&self) -> Result<Vec<String>> {
        let listing = self
            .git
            .run(&self.root, &["ls-files", "--others", "--exclude-standard"])?;
        Ok(listing
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Paths staged for the next commit, relative to the repository root.
    pub fn staged_files(&self) -> Result<Vec<String>> {
        let listing = self
            .git
            .run(&self.root, &["diff", "--cached", "--name-only"])?;
        Ok(listing
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn add_all(&self) -> Result<()> {
        self.git.run(&self.root, &["add", "-A"])?;
        Ok(())
    }

    /// Commits with `message`; the caller is responsible for staging.
    /// Returns the new commit hash.
    pub fn commit(&self, message: &str) -> Result<String> {
        self.git.run(&self.root, &["commit", "-m", message])?;
        self.current_commit_hash()
    }

    /// Stages everything and commits. With no message, asks for one on
    /// stdin; an empty answer or `n` cancels.
    pub fn commit_all(&self, message: Option<&str>) -> Result<CommitOutcome> {
        if !self.has_uncommitted_changes()? {
            tracing::info!(repo = %self.root.display(), "no changes to commit");
            return Ok(CommitOutcome::NothingToCommit);
        }
        let mut files = self.untracked_files()?;
        files.extend(self.changed_files()?);
        tracing::info!(repo = %self.root.display(), files = ?files, "found changes to commit");
        let message = match message {
            Some(message) => message.to_string(),
            None => match prompt_commit_message()? {
                Some(message) => message,
                None => return Ok(CommitOutcome::Cancelled),
            },
        };
        self.add_all()?;
        let hash = self.commit(&message)?;
        Ok(CommitOutcome::Committed { hash })
    }

    pub fn checkout(&self, rev: &str) -> Result<()> {
        self.git.run(&self.root, &["checkout", rev])?;
        Ok(())
    }

    /// Creates `branch` from the tip of the trunk branch and leaves it
    /// checked out.
    pub fn create_branch_from_main(&self, branch: &str) -> Result<()> {
        self.checkout(&self.main_branch)?;
        self.git.run(&self.root, &["checkout", "-b", branch])?;
        Ok(())
    }

    /// Deletes the active branch and returns to trunk when the branch has
    /// no commits beyond trunk. Prevents branch litter from aborted runs.
    pub fn delete_active_branch_if_empty(&self) -> Result<bool> {
        let branch = match self.current_branch()? {
            BranchState::Named(name) if name != self.main_branch => name,
            _ => return Ok(false),
        };
        let main_tip = self.rev_parse(&self.main_branch)?;
        let branch_tip = self.current_commit_hash()?;
        if main_tip != branch_tip {
            return Ok(false);
        }
        tracing::info!(branch, "removing empty results branch");
        self.checkout(&self.main_branch)?;
        self.git.run(&self.root, &["branch", "-d", &branch])?;
        Ok(true)
    }

    /// Stages and stashes all local changes. Returns whether a stash was
    /// created.
    pub fn stash_all(&self) -> Result<bool> {
        if !self.has_uncommitted_changes()? {
            return Ok(false);
        }
        self.add_all()?;
        self.git.run(&self.root, &["stash"])?;
        Ok(true)
    }

    /// Pops the last stash. A modify/delete conflict is expected when the
    /// stashed files were since removed and is ignored; anything else is
    /// an error.
    pub fn stash_pop(&self) -> Result<()> {
        let output = self.git.run_unchecked(&self.root, &["stash", "pop"])?;
        if output.success {
            return Ok(());
        }
        if output.stdout.contains("CONFLICT (modify/delete)")
            || output.stderr.contains("CONFLICT (modify/delete)")
        {
            tracing::debug!("ignored modify/delete conflict while restoring stash");
            return Ok(());
        }
        Err(anyhow!("git stash pop failed: {}", output.stderr.trim()))
    }

    /// Discards all uncommitted and untracked changes. Destructive by
    /// design; `ConfirmMode::Prompt` asks on stdin first.
    pub fn reset_hard(&self, mode: ConfirmMode) -> Result<ResetOutcome> {
        if mode == ConfirmMode::Prompt {
            let mut files = self.untracked_files()?;
            files.extend(self.changed_files()?);
            let proceed = util::confirm(&format!(
                "The repository at {} contains uncommitted changes:\n{}\nThese will be lost if you continue. Proceed?",
                self.root.display(),
                files.join("\n")
            ))?;
            if !proceed {
                return Ok(ResetOutcome::Cancelled);
            }
        }
        self.git.run(&self.root, &["reset", "-q", "--hard", "HEAD"])?;
        let clean = self
            .git
            .run_unchecked(&self.root, &["clean", "-q", "-f", "-d"])?;
        if !clean.success {
            // Read-only imports block clean; make them writable and retry.
            util::make_writable_recursive(&self.root)?;
            self.git.run(&self.root, &["clean", "-q", "-f", "-d"])?;
        }
        Ok(ResetOutcome::Reset)
    }

    /// Configured remote names.
    pub fn remotes(&self) -> Result<Vec<String>> {
        let listing = self.git.run(&self.root, &["remote"])?;
        Ok(listing
            .lines()
            .map(str::to_string)
            .filter(|name| !name.is_empty())
            .collect())
    }

    /// URLs of all configured remotes.
    pub fn remote_urls(&self) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        for remote in self.remotes()? {
            let url = self
                .git
                .run(&self.root, &["remote", "get-url", &remote])?;
            urls.push(url);
        }
        Ok(urls)
    }

    pub fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        self.git.run(&self.root, &["remote", "add", name, url])?;
        Ok(())
    }

    pub fn fetch(&self) -> Result<()> {
        self.git.run(&self.root, &["fetch"])?;
        Ok(())
    }

    pub fn pull(&self) -> Result<()> {
        self.git.run(&self.root, &["pull"])?;
        Ok(())
    }

    /// Pushes all branches to every configured remote. Fails with
    /// [`TrackError::RemoteNotConfigured`] when there is nothing to push
    /// to.
    pub fn push_all(&self) -> Result<()> {
        let remotes = self.remotes()?;
        if remotes.is_empty() {
            return Err(anyhow!(TrackError::RemoteNotConfigured {
                repo: self.root.clone(),
            }));
        }
        for remote in remotes {
            self.git.run(&self.root, &["push", "--all", &remote])?;
        }
        Ok(())
    }
}

fn detect_main_branch(git: &GitClient, root: &Path) -> Result<String> {
    let listing = git.run(root, &["branch", "--list", "--format=%(refname:short)"])?;
    let branches: Vec<&str> = listing.lines().filter(|line| !line.is_empty()).collect();
    if !branches.is_empty() && !branches.contains(&"main") && branches.contains(&"master") {
        Ok("master".to_string())
    } else {
        Ok("main".to_string())
    }
}

fn prompt_commit_message() -> Result<Option<String>> {
    print!("Please enter a commit message for these changes, or 'n' to cancel: ");
    io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("read commit message")?;
    let answer = answer.trim();
    if answer.is_empty() || answer.eq_ignore_ascii_case("n") {
        return Ok(None);
    }
    Ok(Some(answer.to_string()))
}

/// The paired code and results repositories of one project.
#[derive(Debug)]
pub struct Project {
    code: RepositoryHandle,
    results: RepositoryHandle,
    metadata: ProjectMetadata,
}

impl Project {
    /// Opens the project rooted at `path`, cloning the results repository
    /// from its recorded remotes when the folder is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let code = RepositoryHandle::open(path)?;
        let metadata = ProjectMetadata::load(&code.path().join(PROJECT_METADATA_FILE))?;
        let results_path = code.path().join(&metadata.results_folder);
        if !results_path.exists() {
            clone_results_repo(code.git(), &metadata, &results_path)?;
        }
        let results = RepositoryHandle::open_with(code.git().clone(), &results_path)?;
        Ok(Self {
            code,
            results,
            metadata,
        })
    }

    pub fn code(&self) -> &RepositoryHandle {
        &self.code
    }

    pub fn results(&self) -> &RepositoryHandle {
        &self.results
    }

    pub fn metadata(&self) -> &ProjectMetadata {
        &self.metadata
    }

    /// Folder name of the code repository, recorded in ledger rows.
    pub fn folder_name(&self) -> String {
        self.code
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// The ledger file on the results repository's trunk branch.
    pub fn ledger_path(&self) -> PathBuf {
        self.results.path().join(LEDGER_FILE_NAME)
    }

    pub fn run_history_dir(&self) -> PathBuf {
        self.results.path().join(RUN_HISTORY_DIR)
    }

    /// Root of the read-only snapshot cache, beside the results folder.
    pub fn snapshot_root(&self) -> PathBuf {
        self.code
            .path()
            .join(format!("{}_cached", self.metadata.results_folder))
    }

    /// Downloads `url` into the results tree at `rel_path` and returns the
    /// absolute target path.
    pub fn download_file(&self, url: &str, rel_path: &str) -> Result<PathBuf> {
        let target = self.results.path().join(rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let response = ureq::get(url)
            .call()
            .with_context(|| format!("download {url}"))?;
        let mut reader = response.into_reader();
        let mut file = std::fs::File::create(&target)
            .with_context(|| format!("create {}", target.display()))?;
        std::io::copy(&mut reader, &mut file)
            .with_context(|| format!("write {}", target.display()))?;
        Ok(target)
    }
}

fn clone_results_repo(git: &GitClient, metadata: &ProjectMetadata, target: &Path) -> Result<()> {
    if metadata.results_remotes.is_empty() {
        return Err(anyhow!(
            "results repository {} is missing and no remotes are recorded",
            target.display()
        ));
    }
    for (name, url) in &metadata.results_remotes {
        tracing::info!(remote = name, url, "cloning missing results repository");
        match git.clone_filtered(url, None, target) {
            Ok(()) => return Ok(()),
            Err(err) => tracing::warn!(remote = name, error = %err, "clone attempt failed"),
        }
    }
    Err(anyhow!(
        "could not clone results repository into {}",
        target.display()
    ))
}
