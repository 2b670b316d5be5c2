//! Pipeline controller.
//!
//! Drives export and restore jobs as explicit state machines. Each call to a
//! `process_*_slice` method loads the job record, advances it as far as the
//! slice budget allows and persists it again, so any caller (CLI, scheduler,
//! request handler) can resume a job by id.

pub mod budget;
mod export;
mod restore;

use crate::archive::{backend_for, ContainerBackend};
use crate::catalog::{self, ArchiveCatalog, ArchiveMetadata, SourceInfo};
use crate::config::ArchiverConfig;
use crate::db::{self, CheckpointProvider, FileCheckpointProvider};
use crate::job::{validate_job_id, JobKind, JobRecord, ProgressStore};
use crate::registry::{ComponentRegistry, StaticRegistry};
use crate::{ArchiverError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use budget::SliceBudget;

pub struct Pipeline {
    config: ArchiverConfig,
    registry: Box<dyn ComponentRegistry>,
    checkpoints: Box<dyn CheckpointProvider>,
    backend: Box<dyn ContainerBackend>,
    store: ProgressStore,
    catalog: ArchiveCatalog,
}

impl Pipeline {
    /// Pipeline with the collaborators described by the configuration.
    pub fn new(config: ArchiverConfig) -> Result<Self> {
        let registry = Box::new(StaticRegistry::from_config(&config.registry));
        let checkpoints = Box::new(FileCheckpointProvider::new(
            config.site.database_path.clone(),
            config.checkpoints_dir(),
            config.storage.checkpoint_retention,
        ));
        let backend = backend_for(config.archive.backend, config.archive.batch_size);
        Self::with_collaborators(config, registry, checkpoints, backend)
    }

    pub fn with_collaborators(
        config: ArchiverConfig,
        registry: Box<dyn ComponentRegistry>,
        checkpoints: Box<dyn CheckpointProvider>,
        backend: Box<dyn ContainerBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ProgressStore::new(config.jobs_dir());
        let catalog = ArchiveCatalog::new(config.archives_dir());
        tracing::debug!(
            storage = %config.storage.dir.display(),
            backend = ?backend.kind(),
            random_access = backend.supports_random_access(),
            "Pipeline ready"
        );
        Ok(Self {
            config,
            registry,
            checkpoints,
            backend,
            store,
            catalog,
        })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn catalog(&self) -> &ArchiveCatalog {
        &self.catalog
    }

    /// Current record of a job that still has a working directory.
    pub fn job_status(&self, job_id: &str) -> Result<JobRecord> {
        validate_job_id(job_id)?;
        self.store
            .load(job_id)
            .ok_or_else(|| ArchiverError::JobNotFound(job_id.to_string()))
    }

    pub fn list_archives(&self) -> Vec<ArchiveMetadata> {
        self.catalog.list()
    }

    pub fn get_archive_metadata(&self, id: &str) -> Option<ArchiveMetadata> {
        self.catalog.get(id)
    }

    pub fn get_archive_file_path(&self, id: &str) -> Option<PathBuf> {
        self.catalog.file_path(id)
    }

    pub fn delete_archive(&self, id: &str) -> Result<bool> {
        self.catalog.delete(id)
    }

    pub fn handle_uploaded_archive(&self, upload: &Path) -> Result<ArchiveMetadata> {
        catalog::handle_uploaded_archive(
            &self.catalog,
            upload,
            self.config.archive.max_upload_bytes,
            self.config.storage.retention,
        )
    }

    fn source_info(&self) -> SourceInfo {
        SourceInfo {
            site_url: self.config.site.site_url.clone(),
            hostname: self.config.hostname(),
            platform_version: self.config.site.platform_version.clone(),
            database_engine_version: db::engine_version(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Refuse to start a job while another of the same kind is unfinished.
    fn ensure_none_in_flight(&self, kind: JobKind) -> Result<()> {
        for id in self.store.list_ids() {
            if let Some(record) = self.store.load(&id) {
                if record.kind == kind && !record.is_terminal() {
                    return Err(ArchiverError::JobInProgress(kind.as_str().to_string(), id));
                }
            }
        }
        Ok(())
    }

    /// Load a job for driving; the kind must match.
    fn load_job(&self, job_id: &str, kind: JobKind) -> Result<JobRecord> {
        let record = self.job_status(job_id)?;
        if record.kind != kind {
            return Err(ArchiverError::Validation(format!(
                "job {} is a {} job, not {}",
                job_id,
                record.kind.as_str(),
                kind.as_str()
            )));
        }
        Ok(record)
    }

    fn persist(&self, record: &JobRecord) {
        if !self.store.save(&record.id, record) {
            tracing::warn!(job_id = %record.id, "Progress could not be persisted; the next slice repeats work");
        }
    }

    /// Record a phase failure on the job and keep it on disk.
    fn fail_job(&self, record: &mut JobRecord, error: ArchiverError) {
        tracing::error!(job_id = %record.id, phase = ?record.phase, error = %error, "Job failed");
        record.fail(error.to_string());
        self.persist(record);
    }

    /// Delete the working directory of a cancelled job.
    fn cancel_job(&self, job_id: &str, kind: JobKind) -> Result<()> {
        validate_job_id(job_id)?;
        if let Some(record) = self.store.load(job_id) {
            if record.kind != kind {
                return Err(ArchiverError::Validation(format!(
                    "job {} is a {} job, not {}",
                    job_id,
                    record.kind.as_str(),
                    kind.as_str()
                )));
            }
        }
        if !self.store.remove(job_id)? {
            return Err(ArchiverError::JobNotFound(job_id.to_string()));
        }
        tracing::info!(job_id = %job_id, kind = kind.as_str(), "Job cancelled");
        Ok(())
    }

    fn run_to_completion_budget(&self) -> Duration {
        self.config.run_to_completion_budget()
    }
}
