//! Configuration management for the site archiver.
//!
//! Loads configuration from a TOML file; every section falls back to
//! defaults so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Root of the content tree that gets archived and restored
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,

    /// SQLite database file of the site
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Public address of the site, recorded in archive metadata
    #[serde(default)]
    pub site_url: String,

    /// Platform version string, recorded in archive metadata
    #[serde(default)]
    pub platform_version: String,

    /// Host name recorded in archive metadata (detected when absent)
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for archives, job working directories and checkpoints
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,

    /// Number of completed archives kept
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Number of database checkpoints kept
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Wall-clock budget of a single slice, in seconds
    #[serde(default = "default_slice_secs")]
    pub slice_secs: u64,

    /// Per-slice budget used when running a job to completion
    #[serde(default = "default_run_to_completion_secs")]
    pub run_to_completion_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// External dump utility tried on the first database slice (None disables)
    #[serde(default = "default_external_binary")]
    pub external_binary: Option<String>,

    /// Rows fetched per batch by the built-in dumper
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Appends each file to the open container as it is added
    Incremental,
    /// Buffers adds and flushes them in bounded batches
    Batched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Container backend (incremental, batched)
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Files per flush for the batched backend
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Largest accepted uploaded archive, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Follow directory symlinks while enumerating the content tree
    #[serde(default)]
    pub follow_links: bool,

    /// Maximum directory depth while enumerating (None = unlimited)
    #[serde(default)]
    pub max_depth: Option<usize>,

    /// Additional relative paths or bare names never archived
    #[serde(default)]
    pub extra_exclusions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Slug of the active theme (and its parent, if any)
    #[serde(default)]
    pub active_themes: Vec<String>,

    /// Slugs of active plugins
    #[serde(default)]
    pub active_plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_content_dir() -> PathBuf {
    PathBuf::from("/var/www/site/content")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/www/site/site.db")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/site-archiver")
}

fn default_retention() -> usize {
    3
}

fn default_checkpoint_retention() -> usize {
    5
}

fn default_slice_secs() -> u64 {
    10
}

fn default_run_to_completion_secs() -> u64 {
    300
}

fn default_external_binary() -> Option<String> {
    Some("sqlite3".to_string())
}

fn default_batch_rows() -> usize {
    1000
}

fn default_backend() -> BackendKind {
    BackendKind::Incremental
}

fn default_batch_size() -> usize {
    50
}

fn default_max_upload_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            database_path: default_database_path(),
            site_url: String::new(),
            platform_version: String::new(),
            hostname: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            retention: default_retention(),
            checkpoint_retention: default_checkpoint_retention(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            slice_secs: default_slice_secs(),
            run_to_completion_secs: default_run_to_completion_secs(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            external_binary: default_external_binary(),
            batch_rows: default_batch_rows(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            batch_size: default_batch_size(),
            max_upload_bytes: default_max_upload_bytes(),
            follow_links: false,
            max_depth: None,
            extra_exclusions: Vec::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            storage: StorageConfig::default(),
            budget: BudgetConfig::default(),
            dump: DumpConfig::default(),
            archive: ArchiveConfig::default(),
            registry: RegistryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ArchiverConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ArchiverConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at the given directories, everything else default.
    pub fn for_site(content_dir: &Path, database_path: &Path, storage_dir: &Path) -> Self {
        let mut config = Self::default();
        config.site.content_dir = content_dir.to_path_buf();
        config.site.database_path = database_path.to_path_buf();
        config.storage.dir = storage_dir.to_path_buf();
        config
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.dump.batch_rows == 0 {
            return Err(crate::ArchiverError::Config("dump.batch_rows must be at least 1".into()));
        }
        if self.archive.batch_size == 0 {
            return Err(crate::ArchiverError::Config("archive.batch_size must be at least 1".into()));
        }
        if self.storage.retention == 0 {
            return Err(crate::ArchiverError::Config("storage.retention must be at least 1".into()));
        }
        Ok(())
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.storage.dir.join("archives")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.storage.dir.join("jobs")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.storage.dir.join("checkpoints")
    }

    pub fn slice_budget(&self) -> Duration {
        Duration::from_secs(self.budget.slice_secs)
    }

    pub fn run_to_completion_budget(&self) -> Duration {
        Duration::from_secs(self.budget.run_to_completion_secs)
    }

    /// Configured host name, or the detected one.
    pub fn hostname(&self) -> String {
        self.site.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }
}
