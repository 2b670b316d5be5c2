//! Catalog of completed archives.
//!
//! Each archive is a container `<id>.zip` plus its metadata document
//! `<id>.json` in the archives directory. The directory listing is the
//! catalog; there is no index file to keep in sync.

pub mod upload;

use crate::archive::CONTAINER_EXTENSION;
use crate::job::validate_job_id;
use crate::options::ExportOptions;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use upload::handle_uploaded_archive;

const METADATA_EXTENSION: &str = "json";

/// Facts about the site an archive was taken from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub platform_version: String,
    #[serde(default)]
    pub database_engine_version: String,
    #[serde(default)]
    pub tool_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Local,
    Uploaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub id: String,
    pub created_at: String,
    pub completed_at: String,
    pub source: SourceInfo,
    pub source_tag: SourceTag,
    /// Container file name inside the archives directory
    pub container: String,
    pub size: u64,
    pub options: ExportOptions,
    pub file_count: u64,
    pub total_bytes: u64,
    pub has_database: bool,
}

/// The `config.json` document stored first in every container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub archive_id: String,
    pub created_at: String,
    #[serde(default)]
    pub source: SourceInfo,
    #[serde(default)]
    pub options: ExportOptions,
    #[serde(default)]
    pub active_themes: Vec<String>,
    #[serde(default)]
    pub active_plugins: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl ConfigDocument {
    /// Pretty JSON. serde_json leaves `/` unescaped.
    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveCatalog {
    dir: PathBuf,
}

impl ArchiveCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            crate::ArchiverError::Setup(format!(
                "cannot create archives directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Where the container for `id` lives (or will live).
    pub fn container_path_for(&self, id: &str) -> Result<PathBuf> {
        validate_job_id(id)?;
        Ok(self.dir.join(format!("{}.{}", id, CONTAINER_EXTENSION)))
    }

    fn metadata_path_for(&self, id: &str) -> Result<PathBuf> {
        validate_job_id(id)?;
        Ok(self.dir.join(format!("{}.{}", id, METADATA_EXTENSION)))
    }

    pub fn save(&self, metadata: &ArchiveMetadata) -> Result<()> {
        self.ensure_dir()?;
        let path = self.metadata_path_for(&metadata.id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// All archives, newest first by completion time. Unreadable metadata
    /// documents are skipped.
    pub fn list(&self) -> Vec<ArchiveMetadata> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut archives: Vec<ArchiveMetadata> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == METADATA_EXTENSION).unwrap_or(false))
            .filter_map(|p| match read_metadata(&p) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "Skipping unreadable archive metadata");
                    None
                }
            })
            .collect();

        archives.sort_by(|a, b| {
            completion_time(b)
                .cmp(&completion_time(a))
                .then_with(|| b.id.cmp(&a.id))
        });
        archives
    }

    pub fn get(&self, id: &str) -> Option<ArchiveMetadata> {
        let path = self.metadata_path_for(id).ok()?;
        read_metadata(&path).ok()
    }

    /// Container path when both the metadata and the container exist.
    pub fn file_path(&self, id: &str) -> Option<PathBuf> {
        let metadata = self.get(id)?;
        let path = self.dir.join(&metadata.container);
        if metadata.container.contains(['/', '\\']) || !path.is_file() {
            return None;
        }
        Some(path)
    }

    /// Remove container and metadata. Returns false when neither existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let container = self.container_path_for(id)?;
        let metadata = self.metadata_path_for(id)?;
        let mut removed = false;
        for path in [container, metadata] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            tracing::info!(archive_id = %id, "Deleted archive");
        }
        Ok(removed)
    }

    /// Keep the newest `retention` archives; returns the ids deleted.
    pub fn apply_retention(&self, retention: usize) -> Vec<String> {
        let archives = self.list();
        let mut deleted = Vec::new();

        // list() is newest first; everything past the cap goes.
        for old in archives.into_iter().skip(retention.max(1)) {
            match self.delete(&old.id) {
                Ok(_) => {
                    tracing::info!(archive_id = %old.id, completed_at = %old.completed_at, "Removed archive past retention");
                    deleted.push(old.id);
                }
                Err(e) => tracing::warn!(archive_id = %old.id, error = %e, "Failed to remove old archive"),
            }
        }
        deleted
    }
}

/// Unparsable timestamps sort as oldest.
fn completion_time(metadata: &ArchiveMetadata) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    chrono::DateTime::parse_from_rfc3339(&metadata.completed_at).ok()
}

fn read_metadata(path: &Path) -> Result<ArchiveMetadata> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
