//! Enumerating candidate files under a target directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

/// Regular files under `root`, sorted.
///
/// Hidden directories and [`SKIPPED_DIRS`] are pruned. When `extensions` is
/// non-empty only files with one of those extensions are returned. A `root`
/// that is itself a file yields just that file.
pub fn discover_files(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    discover_files_excluding(root, extensions, &[])
}

/// [`discover_files`], also pruning everything under the `excluded` paths.
#[instrument(skip(extensions, excluded), fields(root = %root.display()))]
pub fn discover_files_excluding(
    root: &Path,
    extensions: &[String],
    excluded: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(is_pruned(entry) || excluded.iter().any(|dir| entry.path().starts_with(dir)))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !matches_extension(entry.path(), extensions) {
            continue;
        }
        files.push(entry.into_path());
    }
    files.sort();
    debug!(count = files.len(), "discovered files");
    Ok(files)
}

fn is_pruned(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .map(|ext| ext.to_string_lossy())
        .is_some_and(|ext| extensions.iter().any(|wanted| *wanted == ext))
}
