//! Exclusion policy for the content tree.
//!
//! Entries are relative paths (`plugins/akismet`) or bare names (`cache`).
//! A directory is pruned when its name equals an entry or its relative path
//! equals an entry or lies below one.

use crate::fs::paths::relative_to;
use crate::options::ExportOptions;
use crate::registry::ComponentRegistry;
use std::collections::BTreeSet;
use std::path::Path;

pub const THEMES_DIR: &str = "themes";
pub const PLUGINS_DIR: &str = "plugins";
pub const UPLOADS_DIR: &str = "uploads";
pub const MU_PLUGINS_DIR: &str = "mu-plugins";
pub const CACHE_DIR: &str = "cache";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionPolicy {
    entries: BTreeSet<String>,
}

impl ExclusionPolicy {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for entry in entries {
            policy.add(entry.as_ref());
        }
        policy
    }

    /// Build the policy for an export.
    ///
    /// `self_paths` are the tool's own storage directories; they are always
    /// excluded when they live inside the content tree so an export never
    /// contains earlier archives.
    pub fn build(
        options: &ExportOptions,
        registry: &dyn ComponentRegistry,
        content_dir: &Path,
        self_paths: &[&Path],
        extra: &[String],
    ) -> Self {
        let mut policy = Self::default();

        if !options.include_themes {
            policy.add(THEMES_DIR);
        } else if options.exclude_inactive_themes {
            for slug in subdirectories(&content_dir.join(THEMES_DIR)) {
                if !registry.is_active_theme(&slug) {
                    policy.add(&format!("{}/{}", THEMES_DIR, slug));
                }
            }
        }

        if !options.include_plugins {
            policy.add(PLUGINS_DIR);
        } else if options.exclude_inactive_plugins {
            for slug in subdirectories(&content_dir.join(PLUGINS_DIR)) {
                if !registry.is_active_plugin(&slug) {
                    policy.add(&format!("{}/{}", PLUGINS_DIR, slug));
                }
            }
        }

        if !options.include_uploads {
            policy.add(UPLOADS_DIR);
        }
        if !options.include_mu_plugins {
            policy.add(MU_PLUGINS_DIR);
        }
        if options.exclude_cache {
            policy.add(CACHE_DIR);
        }

        for path in self_paths {
            if let Some(rel) = relative_to(content_dir, path) {
                policy.add(&rel);
            }
        }
        for entry in extra {
            policy.add(entry);
        }

        tracing::debug!(entries = ?policy.entries, "Built exclusion policy");
        policy
    }

    pub fn add(&mut self, entry: &str) {
        let entry = entry.trim().trim_matches('/');
        if !entry.is_empty() {
            self.entries.insert(entry.to_string());
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the directory at `relative_path` (with file name `name`)
    /// should be pruned together with its subtree.
    pub fn excludes_dir(&self, relative_path: &str, name: &str) -> bool {
        self.entries.iter().any(|entry| {
            name == entry
                || relative_path == entry
                || (relative_path.starts_with(entry.as_str())
                    && relative_path.as_bytes().get(entry.len()) == Some(&b'/'))
        })
    }

    /// Files are only dropped on an exact relative-path match.
    pub fn excludes_file(&self, relative_path: &str) -> bool {
        self.entries.contains(relative_path)
    }
}

fn subdirectories(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_name_and_prefix_matching() {
        let policy = ExclusionPolicy::new(["cache", "plugins/akismet"]);

        assert!(policy.excludes_dir("cache", "cache"));
        assert!(policy.excludes_dir("uploads/cache", "cache"));
        assert!(policy.excludes_dir("plugins/akismet", "akismet"));
        assert!(policy.excludes_dir("plugins/akismet/views", "views"));
        assert!(!policy.excludes_dir("plugins/akismet-extra", "akismet-extra"));
        assert!(!policy.excludes_dir("plugins", "plugins"));
    }

    #[test]
    fn test_inactive_plugins_are_excluded() {
        let temp_dir = TempDir::new().unwrap();
        for slug in ["akismet", "hello", "jetpack"] {
            fs::create_dir_all(temp_dir.path().join("plugins").join(slug)).unwrap();
        }
        let options = ExportOptions {
            exclude_inactive_plugins: true,
            ..ExportOptions::default()
        };
        let registry = StaticRegistry::new(Vec::<String>::new(), ["akismet/akismet.php"]);

        let policy = ExclusionPolicy::build(&options, &registry, temp_dir.path(), &[], &[]);
        let entries: Vec<&str> = policy.entries().collect();
        assert!(entries.contains(&"plugins/hello"));
        assert!(entries.contains(&"plugins/jetpack"));
        assert!(!entries.contains(&"plugins/akismet"));
    }

    #[test]
    fn test_disabled_sections_and_self_paths() {
        let temp_dir = TempDir::new().unwrap();
        let storage = temp_dir.path().join("site-archiver");
        fs::create_dir_all(&storage).unwrap();

        let options = ExportOptions {
            include_themes: false,
            include_uploads: false,
            exclude_cache: false,
            ..ExportOptions::default()
        };
        let registry = StaticRegistry::default();
        let outside = TempDir::new().unwrap();

        let policy = ExclusionPolicy::build(
            &options,
            &registry,
            temp_dir.path(),
            &[storage.as_path(), outside.path()],
            &["debug.log".to_string()],
        );
        let entries: Vec<&str> = policy.entries().collect();
        assert_eq!(entries, vec!["debug.log", "site-archiver", "themes", "uploads"]);
    }
}
