//! Code archives for run provenance.
//!
//! Each completed run stores a zip archive of the exact code tree it ran
//! from, so results stay interpretable even if the code repository's
//! history is later rewritten or lost.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::repo::RepositoryHandle;

/// Writes a zip archive of the code tree at `commit` to `target`.
///
/// The tree is taken from a fresh blobless clone so uncommitted edits made
/// while the run was executing never leak into the archive.
pub fn write_code_archive(code: &RepositoryHandle, commit: &str, target: &Path) -> Result<()> {
    let staging = tempfile::tempdir().context("create staging directory for code archive")?;
    let clone_path = staging.path().join("code");
    let source = code.path().to_string_lossy().to_string();
    code.git()
        .clone_filtered(&source, None, &clone_path)
        .context("clone code repository for archiving")?;
    code.git()
        .run(&clone_path, &["checkout", "--detach", commit])
        .with_context(|| format!("check out commit {commit} for archiving"))?;
    zip_tree(&clone_path, target)
        .with_context(|| format!("write code archive {}", target.display()))?;
    Ok(())
}

fn zip_tree(root: &Path, target: &Path) -> Result<()> {
    let file = File::create(target).with_context(|| format!("create {}", target.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut buffer = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
    {
        let entry = entry.context("walk code tree")?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("relativize archive path")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer
                .add_directory(name.as_str(), options)
                .with_context(|| format!("add directory {name}"))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(name.as_str(), options)
                .with_context(|| format!("add file {name}"))?;
            let mut source = File::open(entry.path())
                .with_context(|| format!("open {}", entry.path().display()))?;
            buffer.clear();
            source
                .read_to_end(&mut buffer)
                .with_context(|| format!("read {}", entry.path().display()))?;
            writer.write_all(&buffer).context("write archive entry")?;
        }
    }
    writer.finish().context("finalize archive")?;
    Ok(())
}
