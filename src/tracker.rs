//! The run tracking state machine.
//!
//! A tracker moves through `Idle -> Entered -> {Committed, Failed} -> Idle`.
//! `begin` opens a fresh results branch from the tip of main, the caller
//! writes its outputs into the results tree, and `commit_run` publishes
//! them: one output commit on the branch, one ledger row and metadata
//! bundle on main, one immutable snapshot. `abort` keeps the branch for
//! forensics but never logs it. At most one run is active per tracker.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::archive;
use crate::cache::SnapshotCache;
use crate::environment::Environment;
use crate::errors::TrackError;
use crate::ledger::{LogEntry, RunLedger, ENVIRONMENT_FILE_NAME, LEDGER_FILE_NAME, RUN_HISTORY_DIR};
use crate::options::Options;
use crate::repo::{BranchState, ConfirmMode, Project, ResetOutcome};
use crate::util;
use crate::verify::CACHE_MANIFEST_FILE;

/// Error trace file written into the run's output tree on failure.
pub const ERROR_TRACE_FILE: &str = "error.trace";

/// Captures the package environment a run executes under, as an
/// `environment.yml`-style export. The export mechanism itself is
/// external; the tracker only stores what the exporter returns.
pub trait EnvironmentExporter {
    fn export(&self) -> Result<String>;
}

/// Runs an export command (for example `conda env export`) and captures
/// its stdout.
#[derive(Debug, Clone)]
pub struct CommandEnvironmentExporter {
    command: String,
}

impl CommandEnvironmentExporter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl EnvironmentExporter for CommandEnvironmentExporter {
    fn export(&self) -> Result<String> {
        let words = shell_words::split(&self.command)
            .with_context(|| format!("parse export command {:?}", self.command))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| anyhow!("empty environment export command"))?;
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("run environment export command {:?}", self.command))?;
        if !output.status.success() {
            return Err(anyhow!(
                "environment export command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parameters for one tracked run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub options: Options,
    /// Optional leading component of the results branch name.
    pub branch_prefix: Option<String>,
    pub tags: Vec<String>,
    /// How destructive cleanup of a dirty results repository is guarded.
    pub confirm: ConfirmMode,
}

impl RunRequest {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            branch_prefix: None,
            tags: Vec::new(),
            confirm: ConfirmMode::Prompt,
        }
    }
}

/// How `begin` left the repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// A results branch was opened; outputs go into the results tree.
    Branch(String),
    /// Debug mode: outputs are written in place, nothing is tracked.
    Debug,
    /// The code repository is on a detached HEAD; nothing is tracked.
    Detached,
    /// The user declined the cleanup of a dirty results repository.
    Cancelled,
}

/// A published run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub branch: String,
    pub output_commit: String,
}

/// How `commit_run` concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRunOutcome {
    Logged(CompletedRun),
    /// Debug or detached run; nothing was published.
    Skipped,
}

#[derive(Debug, Clone)]
enum ActiveKind {
    Branch(String),
    Debug,
    Detached,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    kind: ActiveKind,
    code_commit: String,
    fingerprint: String,
    tags: Vec<String>,
    push: bool,
}

#[derive(Debug)]
enum TrackerState {
    Idle,
    Entered(ActiveRun),
    Failed(ActiveRun),
}

/// Everything written to `run_history/<branch>/metadata.json`: the ledger
/// row plus caller-supplied extras.
#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    output_commit_message: &'a str,
    output_branch: &'a str,
    output_commit_hash: &'a str,
    project_commit_hash: &'a str,
    project_folder_name: &'a str,
    project_remotes: &'a str,
    invocation_args: &'a str,
    tags: &'a str,
    options_fingerprint: &'a str,
    options: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<serde_json::Value>,
}

/// Orchestrates branch lifecycle, ledger updates, and snapshots for one
/// project.
pub struct RunTracker<'a> {
    project: &'a Project,
    exporter: Option<Box<dyn EnvironmentExporter>>,
    state: TrackerState,
    invocation_args: String,
    options: Options,
}

impl<'a> RunTracker<'a> {
    pub fn new(project: &'a Project) -> Self {
        let invocation_args = shell_words::join(std::env::args());
        Self {
            project,
            exporter: None,
            state: TrackerState::Idle,
            invocation_args,
            options: Options::default(),
        }
    }

    pub fn with_exporter(mut self, exporter: Box<dyn EnvironmentExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// The directory the caller writes its outputs into.
    pub fn output_path(&self) -> PathBuf {
        self.project.results().path().to_path_buf()
    }

    /// Opens a run: verifies the code repository is clean, resets the
    /// results repository to a pristine state, and creates a fresh results
    /// branch from the tip of main.
    pub fn begin(&mut self, request: RunRequest) -> Result<BeginOutcome> {
        if !matches!(self.state, TrackerState::Idle) {
            return Err(anyhow!("a run is already active; commit or abort it first"));
        }
        self.options = request.options.clone();
        let fingerprint = request.options.fingerprint();

        if request.options.debug() {
            tracing::warn!("debug mode: outputs will not be tracked");
            self.state = TrackerState::Entered(ActiveRun {
                kind: ActiveKind::Debug,
                code_commit: String::new(),
                fingerprint,
                tags: request.tags,
                push: false,
            });
            return Ok(BeginOutcome::Debug);
        }

        let code = self.project.code();
        code.require_clean()?;
        let code_branch = match code.current_branch()? {
            BranchState::Named(name) => name,
            BranchState::Detached => {
                tracing::warn!("code repository is on a detached HEAD; outputs will not be tracked");
                self.state = TrackerState::Entered(ActiveRun {
                    kind: ActiveKind::Detached,
                    code_commit: code.current_commit_hash()?,
                    fingerprint,
                    tags: request.tags,
                    push: false,
                });
                return Ok(BeginOutcome::Detached);
            }
        };
        let code_commit = code.current_commit_hash()?;

        let results = self.project.results();
        if results.has_uncommitted_changes()?
            && results.reset_hard(request.confirm)? == ResetOutcome::Cancelled
        {
            return Ok(BeginOutcome::Cancelled);
        }
        results.delete_active_branch_if_empty()?;

        let branch = branch_name(
            request.branch_prefix.as_deref(),
            &code_branch,
            &code.short_commit_hash()?,
            &fingerprint,
        );
        results.create_branch_from_main(&branch)?;
        // Main's bookkeeping files are not run output; drop them from the
        // new branch's tree so the output commit records only results.
        util::remove_path(&results.path().join(LEDGER_FILE_NAME))?;
        util::remove_path(&results.path().join(RUN_HISTORY_DIR))?;

        tracing::info!(branch, code_commit, "opened results branch");
        self.state = TrackerState::Entered(ActiveRun {
            kind: ActiveKind::Branch(branch.clone()),
            code_commit,
            fingerprint,
            tags: request.tags,
            push: request.options.push(),
        });
        Ok(BeginOutcome::Branch(branch))
    }

    /// Publishes the active run: commits the outputs on the results
    /// branch, snapshots the branch, and records it in the ledger and
    /// `run_history/` on main.
    pub fn commit_run(
        &mut self,
        message: &str,
        extra: Option<serde_json::Value>,
    ) -> Result<CommitRunOutcome> {
        let run = match std::mem::replace(&mut self.state, TrackerState::Idle) {
            TrackerState::Entered(run) => run,
            state => {
                self.state = state;
                return Err(anyhow!("no active run to commit"));
            }
        };
        let branch = match &run.kind {
            ActiveKind::Branch(branch) => branch.clone(),
            ActiveKind::Debug | ActiveKind::Detached => return Ok(CommitRunOutcome::Skipped),
        };

        let code = self.project.code();
        // An uncommitted edit is a concurrent modification too; the hash
        // comparison alone would miss it.
        let mut current = code.current_commit_hash()?;
        if code.has_uncommitted_changes()? {
            current.push_str(" (uncommitted changes)");
        }
        if current != run.code_commit {
            let entered = run.code_commit.clone();
            self.state = TrackerState::Failed(run);
            return Err(anyhow!(TrackError::ConcurrentModification {
                entered,
                current,
            }));
        }

        let results = self.project.results();
        results.add_all()?;
        // The staged deletions of main's bookkeeping files do not count as
        // output.
        let produced_output = results.staged_files()?.iter().any(|path| {
            path != LEDGER_FILE_NAME && !path.starts_with(&format!("{RUN_HISTORY_DIR}/"))
        });
        if !produced_output {
            results.reset_hard(ConfirmMode::Force)?;
            results.delete_active_branch_if_empty()?;
            return Err(anyhow!(TrackError::NoOutputProduced { branch }));
        }
        let output_commit = results.commit(message)?;

        let cache = SnapshotCache::new(self.project);
        cache.materialize(&branch)?;

        let main = results.main_branch().to_string();
        results.checkout(&main)?;
        let entry = self.write_run_history(&run, &branch, message, &output_commit, extra)?;
        RunLedger::append(&self.project.ledger_path(), &entry)?;
        results.add_all()?;
        results.commit(&format!("update log for {branch}"))?;

        // Main gained a ledger row, so its existing snapshot is stale.
        cache.invalidate(&main)?;
        cache.materialize(&main)?;
        results.checkout(&branch)?;

        if run.push {
            results.push_all()?;
        }

        tracing::info!(branch, output_commit, "published run");
        Ok(CommitRunOutcome::Logged(CompletedRun {
            branch,
            output_commit,
        }))
    }

    /// Abandons the active run. The results branch is kept for forensic
    /// inspection with the failure recorded in an error trace file, but it
    /// never enters the ledger.
    pub fn abort(&mut self, error: &anyhow::Error) -> Result<()> {
        let run = match std::mem::replace(&mut self.state, TrackerState::Idle) {
            TrackerState::Entered(run) | TrackerState::Failed(run) => run,
            TrackerState::Idle => return Ok(()),
        };
        let branch = match &run.kind {
            ActiveKind::Branch(branch) => branch.clone(),
            ActiveKind::Debug | ActiveKind::Detached => return Ok(()),
        };

        tracing::error!(branch, error = %error, "run failed; keeping branch for inspection");
        let results = self.project.results();
        let trace_path = results.path().join(ERROR_TRACE_FILE);
        std::fs::write(&trace_path, format!("{error:?}\n"))
            .with_context(|| format!("write {}", trace_path.display()))?;
        results.add_all()?;
        results.commit(&format!("record failed run on {branch}"))?;
        results.checkout(results.main_branch())?;
        Ok(())
    }

    /// Runs `work` inside a tracked span: `begin`, the caller's work,
    /// `commit_run`. Any error -- from the work or from publishing --
    /// aborts the run before propagating.
    pub fn track<T>(
        &mut self,
        request: RunRequest,
        message: &str,
        work: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<TrackedRun<T>> {
        match self.begin(request)? {
            BeginOutcome::Cancelled => return Ok(TrackedRun::Cancelled),
            BeginOutcome::Branch(_) | BeginOutcome::Debug | BeginOutcome::Detached => {}
        }
        let output_path = self.output_path();
        let value = match work(&output_path) {
            Ok(value) => value,
            Err(err) => {
                self.abort(&err)?;
                return Err(err);
            }
        };
        match self.commit_run(message, None) {
            Ok(outcome) => Ok(TrackedRun::Finished { value, outcome }),
            Err(err) => {
                self.abort(&err)?;
                Err(err)
            }
        }
    }

    fn write_run_history(
        &self,
        run: &ActiveRun,
        branch: &str,
        message: &str,
        output_commit: &str,
        extra: Option<serde_json::Value>,
    ) -> Result<LogEntry> {
        let results = self.project.results();
        let history_dir = self.project.run_history_dir().join(branch);
        std::fs::create_dir_all(&history_dir)
            .with_context(|| format!("create {}", history_dir.display()))?;

        let remotes = self.project.code().remote_urls()?.join(", ");
        let tags = run.tags.join(", ");
        let entry = LogEntry::new(
            message,
            branch,
            output_commit,
            run.code_commit.as_str(),
            self.project.folder_name(),
            remotes,
            self.invocation_args.as_str(),
            tags,
            run.fingerprint.as_str(),
        );

        let metadata = RunMetadata {
            output_commit_message: message,
            output_branch: branch,
            output_commit_hash: output_commit,
            project_commit_hash: &run.code_commit,
            project_folder_name: &entry.project_folder_name,
            project_remotes: &entry.project_remotes,
            invocation_args: &self.invocation_args,
            tags: &entry.tags,
            options_fingerprint: &run.fingerprint,
            options: self.options.to_json_value(),
            extra,
        };
        let metadata_path = history_dir.join("metadata.json");
        let text = serde_json::to_string_pretty(&metadata).context("serialize run metadata")?;
        std::fs::write(&metadata_path, text)
            .with_context(|| format!("write {}", metadata_path.display()))?;

        if let Some(exporter) = &self.exporter {
            let export = exporter.export().context("export environment")?;
            // The export must parse back; otherwise the locator's
            // environment predicate would silently fail on this row later.
            Environment::from_export(&export).context("validate environment export")?;
            std::fs::write(history_dir.join(ENVIRONMENT_FILE_NAME), export)
                .context("write environment export")?;
        }

        let manifest_path = results.path().join(CACHE_MANIFEST_FILE);
        if manifest_path.exists() {
            std::fs::copy(&manifest_path, history_dir.join(CACHE_MANIFEST_FILE))
                .context("copy cache manifest into run history")?;
        }

        archive::write_code_archive(
            self.project.code(),
            &run.code_commit,
            &history_dir.join("code.zip"),
        )?;
        Ok(entry)
    }
}

/// Result of a full tracked span.
#[derive(Debug)]
pub enum TrackedRun<T> {
    Finished { value: T, outcome: CommitRunOutcome },
    Cancelled,
}

fn branch_name(prefix: Option<&str>, code_branch: &str, short_commit: &str, fingerprint: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let token: String = fingerprint.chars().take(5).collect();
    match prefix {
        Some(prefix) => format!("{prefix}_{timestamp}_{code_branch}_{short_commit}_{token}"),
        None => format!("{timestamp}_{code_branch}_{short_commit}_{token}"),
    }
}
