//! Filesystem helpers shared by the snapshot cache, verifier, and tracker.

use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Deep-copies `source` into `target`, skipping any `.git` directory.
pub fn copy_tree_excluding_git(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && entry.file_name() == ".git"))
    {
        let entry = entry.context("walk source tree")?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("strip source prefix")?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Marks every regular file under `root` read-only.
pub fn make_readonly_recursive(root: &Path) -> Result<()> {
    set_tree_readonly(root, true)
}

/// Clears the read-only bit on every file and directory under `root`.
pub fn make_writable_recursive(root: &Path) -> Result<()> {
    set_tree_readonly(root, false)
}

fn set_tree_readonly(root: &Path, readonly: bool) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.context("walk tree")?;
        if readonly && !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("inspect {}", entry.path().display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_readonly(readonly);
        fs::set_permissions(entry.path(), permissions)
            .with_context(|| format!("chmod {}", entry.path().display()))?;
    }
    Ok(())
}

/// Removes a file or directory tree, clearing read-only bits when the
/// first attempt fails. Snapshot cache entries are read-only, so plain
/// removal is expected to fail on them.
pub fn remove_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if path.is_dir() {
        if fs::remove_dir_all(path).is_err() {
            make_writable_recursive(path)?;
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
        }
    } else if fs::remove_file(path).is_err() {
        let mut permissions = fs::metadata(path)
            .with_context(|| format!("inspect {}", path.display()))?
            .permissions();
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)
            .with_context(|| format!("chmod {}", path.display()))?;
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

/// Appends `line` to the file at `path`, creating it when absent and
/// repairing a missing trailing newline first. Already-present lines are
/// not duplicated.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut contents = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    if contents.lines().any(|existing| existing == line) {
        return Ok(());
    }
    contents.push_str(line);
    contents.push('\n');
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Interactive yes/no confirmation on stdin. Empty input counts as yes.
pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} Y/n ");
    io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("read confirmation")?;
    let answer = answer.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_tree_skips_git_metadata() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join(".git")).unwrap();
        fs::create_dir_all(source.join("data")).unwrap();
        fs::write(source.join(".git/config"), "x").unwrap();
        fs::write(source.join("data/result.csv"), "1,2,3").unwrap();

        let target = dir.path().join("copy");
        copy_tree_excluding_git(&source, &target).unwrap();
        assert!(target.join("data/result.csv").exists());
        assert!(!target.join(".git").exists());
    }

    #[test]
    fn readonly_trees_can_still_be_removed() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("a.txt"), "1").unwrap();
        make_readonly_recursive(&tree).unwrap();

        let metadata = fs::metadata(tree.join("a.txt")).unwrap();
        assert!(metadata.permissions().readonly());

        remove_path(&tree).unwrap();
        assert!(!tree.exists());
    }

    #[test]
    fn append_line_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".gitignore");
        append_line(&path, "external_cache/data").unwrap();
        append_line(&path, "external_cache/data").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("external_cache/data").count(), 1);
    }
}
