//! Append-only run ledger stored on the results repository's main branch.
//!
//! The ledger is a tab-separated UTF-8 table with one row per completed run,
//! keyed by output branch. Rows are only ever appended; chronological file
//! order is the source of truth for recency. Loading is forgiving (legacy
//! headers, short rows), appending is strict.

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use std::cell::OnceCell;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::environment::Environment;
use crate::errors::TrackError;

/// Ledger file name on the results main branch.
pub const LEDGER_FILE_NAME: &str = "log.tsv";
/// Per-run metadata directory on the results main branch.
pub const RUN_HISTORY_DIR: &str = "run_history";
/// Environment export side file inside `run_history/<branch>/`.
pub const ENVIRONMENT_FILE_NAME: &str = "environment.yml";

/// The nine canonical ledger columns, in writing order.
pub const CANONICAL_HEADER: [&str; 9] = [
    "Output commit message",
    "Output branch",
    "Output commit hash",
    "Project commit hash",
    "Project folder name",
    "Project remotes",
    "Invocation args",
    "Tags",
    "Options fingerprint",
];

/// One row of the ledger.
#[derive(Debug)]
pub struct LogEntry {
    pub commit_message: String,
    pub branch: String,
    pub output_commit_hash: String,
    pub project_commit_hash: String,
    pub project_folder_name: String,
    pub project_remotes: String,
    pub invocation_args: String,
    pub tags: String,
    pub options_fingerprint: String,
    /// `run_history/` directory to resolve the environment side file from.
    history_dir: Option<PathBuf>,
    environment: OnceCell<Option<Environment>>,
}

impl LogEntry {
    /// Builds an in-memory entry with no backing side files.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commit_message: impl Into<String>,
        branch: impl Into<String>,
        output_commit_hash: impl Into<String>,
        project_commit_hash: impl Into<String>,
        project_folder_name: impl Into<String>,
        project_remotes: impl Into<String>,
        invocation_args: impl Into<String>,
        tags: impl Into<String>,
        options_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            commit_message: commit_message.into(),
            branch: branch.into(),
            output_commit_hash: output_commit_hash.into(),
            project_commit_hash: project_commit_hash.into(),
            project_folder_name: project_folder_name.into(),
            project_remotes: project_remotes.into(),
            invocation_args: invocation_args.into(),
            tags: tags.into(),
            options_fingerprint: options_fingerprint.into(),
            history_dir: None,
            environment: OnceCell::new(),
        }
    }

    fn from_row(columns: &IndexMap<String, usize>, row: &[String], history_dir: &Path) -> Self {
        let field = |name: &str| -> String {
            columns
                .get(name)
                .and_then(|idx| row.get(*idx))
                .cloned()
                .unwrap_or_default()
        };
        Self {
            commit_message: field("output_commit_message"),
            branch: field("output_branch"),
            output_commit_hash: field("output_commit_hash"),
            project_commit_hash: field("project_commit_hash"),
            project_folder_name: field("project_folder_name"),
            project_remotes: field("project_remotes"),
            invocation_args: field("invocation_args"),
            tags: field("tags"),
            options_fingerprint: field("options_fingerprint"),
            history_dir: Some(history_dir.to_path_buf()),
            environment: OnceCell::new(),
        }
    }

    fn to_row(&self) -> [&str; 9] {
        [
            &self.commit_message,
            &self.branch,
            &self.output_commit_hash,
            &self.project_commit_hash,
            &self.project_folder_name,
            &self.project_remotes,
            &self.invocation_args,
            &self.tags,
            &self.options_fingerprint,
        ]
    }

    pub fn matches_fingerprint(&self, fingerprint: &str) -> bool {
        self.options_fingerprint == fingerprint
    }

    pub fn matches_project_commit(&self, commit_hash: &str) -> bool {
        self.project_commit_hash == commit_hash
    }

    /// The environment this run executed under, loaded on first access from
    /// `run_history/<branch>/environment.yml` and cached. Returns `None`
    /// when the side file is missing or unreadable; that is an expected
    /// state for legacy rows and is logged, not raised.
    pub fn environment(&self) -> Option<&Environment> {
        self.environment
            .get_or_init(|| {
                let history_dir = self.history_dir.as_ref()?;
                let path = history_dir.join(&self.branch).join(ENVIRONMENT_FILE_NAME);
                match Environment::from_export_file(&path) {
                    Ok(environment) => Some(environment),
                    Err(err) => {
                        tracing::warn!(
                            branch = self.branch,
                            error = %err,
                            "could not load environment side file"
                        );
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Whether this run's recorded environment satisfies `required`.
    /// A run whose environment cannot be loaded satisfies nothing.
    pub fn fulfils_environment(&self, required: Option<&Environment>) -> bool {
        if required.is_none() {
            return true;
        }
        match self.environment() {
            Some(environment) => environment.fulfils_environment(required),
            None => false,
        }
    }
}

/// Ordered, branch-keyed collection of [`LogEntry`] rows.
#[derive(Debug, Default)]
pub struct RunLedger {
    path: Option<PathBuf>,
    entries: IndexMap<String, LogEntry>,
}

impl RunLedger {
    /// Loads the ledger table. A missing file yields an empty ledger.
    ///
    /// Header names are normalized (lowercase, spaces to underscores); a
    /// legacy header missing the trailing fingerprint column gains it
    /// empty; rows shorter than the header are padded with empty strings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: Some(path.to_path_buf()),
                entries: IndexMap::new(),
            });
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read ledger {}", path.display()))?;
        let history_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(RUN_HISTORY_DIR);

        let mut lines = text.lines();
        let header = match lines.next() {
            Some(line) => line,
            None => {
                return Ok(Self {
                    path: Some(path.to_path_buf()),
                    entries: IndexMap::new(),
                })
            }
        };
        let mut names: Vec<String> = header.split('\t').map(normalize_column).collect();
        if names.len() < CANONICAL_HEADER.len() {
            names.push(normalize_column(
                CANONICAL_HEADER[CANONICAL_HEADER.len() - 1],
            ));
        }
        let columns: IndexMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut entries = IndexMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let mut row: Vec<String> = line.split('\t').map(str::to_string).collect();
            while row.len() < names.len() {
                row.push(String::new());
            }
            let entry = LogEntry::from_row(&columns, &row, &history_dir);
            if entry.branch.is_empty() {
                tracing::warn!(line, "skipping ledger row without a branch");
                continue;
            }
            entries.insert(entry.branch.clone(), entry);
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// Builds a ledger purely in memory, in append order.
    pub fn from_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        Self {
            path: None,
            entries: entries
                .into_iter()
                .map(|entry| (entry.branch.clone(), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, branch: &str) -> Option<&LogEntry> {
        self.entries.get(branch)
    }

    /// Entries in append order; reverse for most-recent-first scans.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.entries.values()
    }

    /// Appends one entry to the ledger file, creating it (with the
    /// canonical header) when absent. An existing header that does not
    /// exactly match the canonical one fails with a `Schema` error; rows
    /// are never rewritten.
    pub fn append(path: &Path, entry: &LogEntry) -> Result<()> {
        let canonical: Vec<String> = CANONICAL_HEADER.iter().map(|s| normalize_column(s)).collect();
        let mut contents = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read ledger {}", path.display()))?;
            let header = text.lines().next().unwrap_or_default();
            let found: Vec<String> = header.split('\t').map(normalize_column).collect();
            if found != canonical {
                return Err(anyhow!(TrackError::Schema {
                    path: path.to_path_buf(),
                    expected: canonical.join(", "),
                    found: found.join(", "),
                }));
            }
            let mut text = text;
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text
        } else {
            format!("{}\n", CANONICAL_HEADER.join("\t"))
        };

        contents.push_str(&entry.to_row().join("\t"));
        contents.push('\n');
        std::fs::write(path, contents)
            .with_context(|| format!("write ledger {}", path.display()))?;
        Ok(())
    }

    /// Plain-text table for the `log` command.
    pub fn render_table(&self) -> String {
        let header: Vec<&str> = CANONICAL_HEADER.to_vec();
        let rows: Vec<[&str; 9]> = self.entries.values().map(LogEntry::to_row).collect();

        let mut widths: Vec<usize> = header.iter().map(|cell| cell.len()).collect();
        for row in &rows {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.len());
            }
        }

        let mut out = String::new();
        for (idx, cell) in header.iter().enumerate() {
            let _ = write!(out, "{cell:width$}  ", width = widths[idx]);
        }
        out.push('\n');
        for row in &rows {
            for (idx, cell) in row.iter().enumerate() {
                let _ = write!(out, "{cell:width$}  ", width = widths[idx]);
            }
            out.push('\n');
        }
        out
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn normalize_column(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}
