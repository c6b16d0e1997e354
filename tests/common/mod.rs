//! Shared test infrastructure for integration tests.
//!
//! Builds a throwaway project on disk: a code repository with a committed
//! `.runtrack.json` and a paired results repository, both with an initial
//! commit on `main`. Tests that need git skip themselves when no `git`
//! binary is on the PATH.

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use runtrack::git::GitClient;
use runtrack::repo::PROJECT_METADATA_FILE;
use runtrack::{Project, ProjectMetadata};

pub const RESULTS_FOLDER: &str = "results";

/// A temporary paired code/results project.
pub struct ProjectFixture {
    _dir: TempDir,
    pub code_path: PathBuf,
}

impl ProjectFixture {
    /// Returns `None` (after logging) when git is unavailable.
    pub fn create() -> Option<Self> {
        if !GitClient::available() {
            eprintln!("Skipping: no git binary on PATH");
            return None;
        }
        let dir = TempDir::new().expect("create temp dir");
        let code_path = dir.path().join("study");
        let results_path = code_path.join(RESULTS_FOLDER);

        init_repo(&code_path);
        std::fs::write(code_path.join("main.py"), "print('hello')\n").unwrap();
        std::fs::write(
            code_path.join(".gitignore"),
            format!("{RESULTS_FOLDER}/\n{RESULTS_FOLDER}_cached/\n"),
        )
        .unwrap();
        let metadata = ProjectMetadata {
            project_id: "test-project".to_string(),
            results_folder: RESULTS_FOLDER.to_string(),
            results_remotes: Default::default(),
        };
        metadata
            .save(&code_path.join(PROJECT_METADATA_FILE))
            .unwrap();
        commit_all(&code_path, "initial code");

        init_repo(&results_path);
        std::fs::write(results_path.join("README.md"), "# results\n").unwrap();
        commit_all(&results_path, "initial results");

        Some(Self {
            _dir: dir,
            code_path,
        })
    }

    pub fn open_project(&self) -> Project {
        Project::open(&self.code_path).expect("open project")
    }

    pub fn results_path(&self) -> PathBuf {
        self.code_path.join(RESULTS_FOLDER)
    }

    /// Commits a change to the code repository, advancing its HEAD.
    pub fn commit_code_change(&self, file: &str, contents: &str) {
        std::fs::write(self.code_path.join(file), contents).unwrap();
        commit_all(&self.code_path, "code change");
    }
}

/// Initializes a repository with `main` as its default branch and a local
/// committer identity, so tests do not depend on global git configuration.
pub fn init_repo(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    run_git(path, &["init", "-b", "main"]);
    configure_identity(path);
}

/// Gives a repository a local committer identity so commits work without
/// global git configuration.
pub fn configure_identity(path: &Path) {
    run_git(path, &["config", "user.name", "runtrack tests"]);
    run_git(path, &["config", "user.email", "tests@example.org"]);
    run_git(path, &["config", "commit.gpgsign", "false"]);
}

pub fn commit_all(path: &Path, message: &str) {
    run_git(path, &["add", "-A"]);
    run_git(path, &["commit", "-m", message]);
}

pub fn run_git(path: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
