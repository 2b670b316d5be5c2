//! Content-tree enumeration.
//!
//! Walks the tree depth-first in file-name order, prunes excluded
//! directories and produces the manifest consumed by the archive phase.

use crate::fs::exclusion::ExclusionPolicy;
use crate::fs::paths::to_slash;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links to directories. Loops are detected by walkdir
    /// and dropped like unreadable entries.
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,
}

/// A file slated for archiving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Relative path from the root, forward slashes
    pub relative_path: String,

    /// File size in bytes (resolved through symlinks)
    pub size: u64,
}

/// Totals produced by one enumeration pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Enumeration {
    pub file_count: u64,
    pub total_bytes: u64,
}

impl ManifestEntry {
    /// Build an entry from a DirEntry.
    /// Returns None for directories, symlinks to directories, broken
    /// symlinks, and names the manifest cannot carry.
    fn from_entry(entry: &DirEntry, root: &Path) -> Option<Self> {
        let path = entry.path();
        let size = if entry.path_is_symlink() {
            match std::fs::metadata(path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                _ => return None,
            }
        } else {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            metadata.len()
        };

        let relative = path.strip_prefix(root).ok()?;
        if relative.to_str().is_none() {
            tracing::warn!(path = %path.display(), "Skipping non UTF-8 file name");
            return None;
        }
        let relative_path = to_slash(relative);
        if relative_path.contains(['\n', '\r']) {
            tracing::warn!(path = %path.display(), "Skipping file name containing a line break");
            return None;
        }

        Some(Self {
            relative_path,
            size,
        })
    }
}

/// Walk the tree, calling `callback` for each file that survives the policy.
///
/// Only failure to read the root itself is an error; anything unreadable
/// below it is skipped.
pub fn walk_with_callback<F>(
    root: &Path,
    policy: &ExclusionPolicy,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(ManifestEntry) -> std::io::Result<()>,
{
    std::fs::read_dir(root)?;

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let iter = walker
        .into_iter()
        .filter_entry(|entry| !should_prune(entry, root, policy));

    for entry in iter {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let Some(file) = ManifestEntry::from_entry(&entry, root) else {
            continue;
        };
        if policy.excludes_file(&file.relative_path) {
            continue;
        }
        callback(file)?;
    }

    Ok(())
}

/// Collect the manifest in memory.
pub fn collect(
    root: &Path,
    policy: &ExclusionPolicy,
    options: &WalkOptions,
) -> std::io::Result<Vec<ManifestEntry>> {
    let mut files = Vec::new();
    walk_with_callback(root, policy, options, |file| {
        files.push(file);
        Ok(())
    })?;
    Ok(files)
}

/// Walk the tree and write the manifest file, one relative path per line.
pub fn enumerate_to_manifest(
    root: &Path,
    policy: &ExclusionPolicy,
    options: &WalkOptions,
    manifest_path: &Path,
) -> std::io::Result<Enumeration> {
    let mut writer = BufWriter::new(File::create(manifest_path)?);
    let mut totals = Enumeration::default();

    walk_with_callback(root, policy, options, |file| {
        writer.write_all(file.relative_path.as_bytes())?;
        writer.write_all(b"\n")?;
        totals.file_count += 1;
        totals.total_bytes += file.size;
        Ok(())
    })?;

    writer.flush()?;
    Ok(totals)
}

fn should_prune(entry: &DirEntry, root: &Path, policy: &ExclusionPolicy) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() || policy.is_empty() {
        return false;
    }
    let Ok(relative) = entry.path().strip_prefix(root) else {
        return false;
    };
    let name = entry.file_name().to_string_lossy();
    policy.excludes_dir(&to_slash(relative), &name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(files: &[ManifestEntry]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = collect(temp_dir.path(), &ExclusionPolicy::default(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        assert!(collect(&missing, &ExclusionPolicy::default(), &WalkOptions::default()).is_err());
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b"))?;
        fs::create_dir_all(root.join("cache"))?;
        fs::write(root.join("a.txt"), [b'a'; 10])?;
        fs::write(root.join("b/c.txt"), [b'c'; 20])?;
        fs::write(root.join("cache/d.txt"), [b'd'; 5])?;

        let scratch = TempDir::new()?;
        let manifest = scratch.path().join("manifest.txt");
        let policy = ExclusionPolicy::new(["cache"]);
        let totals = enumerate_to_manifest(root, &policy, &WalkOptions::default(), &manifest)?;

        assert_eq!(totals.file_count, 2);
        assert_eq!(totals.total_bytes, 30);
        assert_eq!(fs::read_to_string(&manifest)?, "a.txt\nb/c.txt\n");
        Ok(())
    }

    #[test]
    fn test_nested_name_match_and_file_exclusion() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("uploads/cache"))?;
        fs::write(root.join("uploads/cache/x.bin"), b"x")?;
        fs::write(root.join("uploads/photo.jpg"), b"jpg")?;
        fs::write(root.join("debug.log"), b"log")?;

        let policy = ExclusionPolicy::new(["cache", "debug.log"]);
        let files = collect(root, &policy, &WalkOptions::default())?;
        assert_eq!(paths(&files), vec!["uploads/photo.jpg"]);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinked_directories_are_not_followed_by_default() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("real"))?;
        fs::write(root.join("real/file.txt"), b"12345")?;
        std::os::unix::fs::symlink(root.join("real"), root.join("loop"))?;
        std::os::unix::fs::symlink(root.join("real/file.txt"), root.join("alias.txt"))?;

        let files = collect(root, &ExclusionPolicy::default(), &WalkOptions::default())?;
        assert_eq!(paths(&files), vec!["alias.txt", "real/file.txt"]);
        assert_eq!(files[0].size, 5);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_cycle_terminates_when_following() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("dir"))?;
        fs::write(root.join("dir/file.txt"), b"x")?;
        std::os::unix::fs::symlink(root.join("dir"), root.join("dir/back"))?;

        let options = WalkOptions {
            follow_links: true,
            max_depth: None,
        };
        let files = collect(root, &ExclusionPolicy::default(), &options)?;
        assert_eq!(paths(&files), vec!["dir/file.txt"]);
        Ok(())
    }
}
