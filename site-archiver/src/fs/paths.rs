//! Path containment checks shared by archive build and extraction.

use crate::{ArchiverError, Result};
use std::path::{Component, Path, PathBuf};

/// Turn a slash-separated relative path from a manifest line or container
/// entry into a safe relative `PathBuf`.
///
/// Rejects parent-directory segments, absolute paths and drive prefixes.
/// Empty and `.` segments are dropped.
pub fn sanitize_relative(raw: &str) -> Result<PathBuf> {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(ArchiverError::PathTraversal(format!("absolute path '{}'", raw)));
    }

    let mut clean = PathBuf::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(ArchiverError::PathTraversal(format!(
                    "parent directory segment in '{}'",
                    raw
                )))
            }
            s if s.contains(':') || s.contains('\0') => {
                return Err(ArchiverError::PathTraversal(format!(
                    "illegal segment '{}' in '{}'",
                    s, raw
                )))
            }
            s => clean.push(s),
        }
    }

    // Belt and braces: nothing but normal components may survive.
    if clean.as_os_str().is_empty()
        || !clean.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(ArchiverError::PathTraversal(format!("unusable path '{}'", raw)));
    }

    Ok(clean)
}

/// Resolve `relative` under `root` and verify the real location (after
/// following symlinks) is still inside the real root.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let clean = sanitize_relative(relative)?;
    let real_root = root.canonicalize()?;
    let real_path = root.join(&clean).canonicalize()?;
    if !real_path.starts_with(&real_root) {
        return Err(ArchiverError::PathTraversal(format!(
            "'{}' resolves outside {}",
            relative,
            root.display()
        )));
    }
    Ok(real_path)
}

/// Relative path of `path` under `root`, if it lies inside it.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let rel = path.strip_prefix(&root).ok()?;
    let rel = to_slash(rel);
    if rel.is_empty() {
        None
    } else {
        Some(rel)
    }
}

/// Forward-slash form of a relative path, as stored in manifests and
/// container entry names.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_accepts_normal_paths() {
        assert_eq!(sanitize_relative("a/b/c.txt").unwrap(), PathBuf::from("a/b/c.txt"));
        assert_eq!(sanitize_relative("./a//b").unwrap(), PathBuf::from("a/b"));
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize_relative("../../etc/passwd").is_err());
        assert!(sanitize_relative("a/../../b").is_err());
        assert!(sanitize_relative("/etc/passwd").is_err());
        assert!(sanitize_relative("C:/Windows").is_err());
        assert!(sanitize_relative("a\\..\\b").is_err());
        assert!(sanitize_relative("").is_err());
    }

    #[test]
    fn test_resolve_within() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/file.txt"), b"x").unwrap();

        assert!(resolve_within(temp_dir.path(), "sub/file.txt").is_ok());
        assert!(resolve_within(temp_dir.path(), "sub/missing.txt").is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_resolve_within_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"s").unwrap();

        let root = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link")).unwrap();

        let err = resolve_within(root.path(), "link").unwrap_err();
        assert!(matches!(err, ArchiverError::PathTraversal(_)));
    }

    #[test]
    fn test_relative_to() {
        let temp_dir = TempDir::new().unwrap();
        let inner = temp_dir.path().join("x/y");
        fs::create_dir_all(&inner).unwrap();
        assert_eq!(relative_to(temp_dir.path(), &inner).as_deref(), Some("x/y"));
        assert_eq!(relative_to(&inner, temp_dir.path()), None);
    }
}
