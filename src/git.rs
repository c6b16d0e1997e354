//! Subprocess interface to the external `git` tool.
//!
//! The engine never manipulates repository objects directly; every mutation
//! goes through the porcelain commands issued here. Calls are synchronous
//! and block for the duration of the external process.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// Captured result of a git invocation that is allowed to fail.
#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Locator and runner for the external `git` executable.
#[derive(Debug, Clone)]
pub struct GitClient {
    program: PathBuf,
}

impl GitClient {
    /// Resolves `git` on PATH once; every handle clones this client.
    pub fn locate() -> Result<Self> {
        let program = which::which("git").context("locate the git executable on PATH")?;
        Ok(Self { program })
    }

    /// Whether a git executable is available at all. Used by tests to skip.
    pub fn available() -> bool {
        which::which("git").is_ok()
    }

    /// Runs git in `workdir` and returns trimmed stdout, failing on a
    /// nonzero exit status.
    pub fn run(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        let output = self.run_unchecked(workdir, args)?;
        if !output.success {
            return Err(anyhow!(
                "git {} failed in {}: {}",
                args.join(" "),
                workdir.display(),
                output.stderr.trim()
            ));
        }
        Ok(output.stdout)
    }

    /// Runs git and reports the outcome without treating failure as an
    /// error. Callers that tolerate specific failures (stash pop
    /// conflicts, clean on read-only trees) use this.
    pub fn run_unchecked(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput> {
        let start = Instant::now();
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        let elapsed_ms = start.elapsed().as_millis();
        tracing::debug!(
            elapsed_ms,
            command = args.join(" "),
            workdir = %workdir.display(),
            success = output.status.success(),
            "git invoke complete"
        );
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout)
                .trim_end()
                .to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Shallow, single-branch, blob-filtered clone of `source` into
    /// `target`. Used for external data pinning and code archival, where
    /// history blobs are dead weight.
    pub fn clone_filtered(&self, source: &str, branch: Option<&str>, target: &Path) -> Result<()> {
        let target_str = target
            .to_str()
            .ok_or_else(|| anyhow!("clone target is not valid UTF-8: {}", target.display()))?;
        let mut args = vec!["clone", "--filter=blob:none", "--single-branch"];
        if let Some(branch) = branch {
            args.extend(["--branch", branch]);
        }
        args.extend([source, target_str]);
        let workdir = target.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(workdir)
            .with_context(|| format!("create {}", workdir.display()))?;
        self.run(workdir, &args)
            .with_context(|| format!("clone {source} into {}", target.display()))?;
        Ok(())
    }
}
