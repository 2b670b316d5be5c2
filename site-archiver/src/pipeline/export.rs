//! Export state machine: config → database → enumerate → archive → finalize.

use super::{Pipeline, SliceBudget};
use crate::archive::{build_slice, BuildInputs};
use crate::catalog::{ArchiveMetadata, ConfigDocument, SourceTag};
use crate::db::{DatabaseDumper, RowFilter};
use crate::fs::exclusion::ExclusionPolicy;
use crate::fs::walker::{self, WalkOptions};
use crate::job::{ExportPhase, JobKind, JobRecord, Phase};
use crate::options::ExportOptions;
use crate::utils::format::{format_bytes, format_elapsed};
use crate::{ArchiverError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DOCUMENT_FILE: &str = "config.json";
const DUMP_FILE: &str = "database.sql";
const MANIFEST_FILE: &str = "manifest.txt";

impl Pipeline {
    /// Create and persist a new export job. Nothing is archived yet.
    pub fn init_export(&self, options: ExportOptions) -> Result<JobRecord> {
        if !self.config.site.content_dir.is_dir() {
            return Err(ArchiverError::Setup(format!(
                "content directory not found: {}",
                self.config.site.content_dir.display()
            )));
        }
        self.ensure_none_in_flight(JobKind::Export)?;
        self.catalog.ensure_dir()?;

        let record = JobRecord::new_export(options);
        self.store.ensure_job_dir(&record.id)?;
        if !self.store.save(&record.id, &record) {
            let _ = self.store.remove(&record.id);
            return Err(ArchiverError::Setup(format!("cannot persist job record for {}", record.id)));
        }

        tracing::info!(job_id = %record.id, options = ?record.options, "Export started");
        Ok(record)
    }

    /// Advance an export by one slice of the configured budget.
    pub fn process_export_slice(&self, job_id: &str) -> Result<JobRecord> {
        self.export_slice_with(job_id, self.config.slice_budget())
    }

    /// Start an export and drive it until it completes or fails.
    pub fn run_export_to_completion(&self, options: ExportOptions) -> Result<JobRecord> {
        let started = std::time::Instant::now();
        let mut record = self.init_export(options)?;
        while !record.is_terminal() {
            record = self.export_slice_with(&record.id, self.run_to_completion_budget())?;
        }
        tracing::info!(job_id = %record.id, elapsed = %format_elapsed(started.elapsed()), "Export run finished");
        Ok(record)
    }

    /// Drop an export job and its partial container.
    pub fn cancel_export(&self, job_id: &str) -> Result<()> {
        self.cancel_job(job_id, JobKind::Export)?;
        if self.catalog.get(job_id).is_none() {
            let partial = self.catalog.container_path_for(job_id)?;
            if partial.exists() {
                std::fs::remove_file(&partial)?;
            }
        }
        Ok(())
    }

    fn export_slice_with(&self, job_id: &str, limit: Duration) -> Result<JobRecord> {
        let mut record = self.load_job(job_id, JobKind::Export)?;
        if record.is_terminal() {
            return Ok(record);
        }

        let budget = SliceBudget::new(limit);
        match self.drive_export(&mut record, &budget) {
            Ok(()) => {
                record.touch();
                // A finished export has already removed its working directory.
                if !record.completed {
                    self.persist(&record);
                }
                tracing::debug!(
                    job_id = %record.id,
                    phase = ?record.phase,
                    percent = record.progress_percent,
                    units = budget.units(),
                    elapsed = %format_elapsed(budget.elapsed()),
                    "Export slice done"
                );
            }
            Err(e) => self.fail_job(&mut record, e),
        }
        Ok(record)
    }

    fn drive_export(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<()> {
        loop {
            let Phase::Export(phase) = record.phase else {
                return Err(ArchiverError::Phase(format!("job {} is not an export", record.id)));
            };
            if phase == ExportPhase::Complete || budget.should_yield() {
                return Ok(());
            }

            let done = match phase {
                ExportPhase::Config => self.export_config(record, budget)?,
                ExportPhase::Database => self.export_database(record, budget)?,
                ExportPhase::Enumerate => self.export_enumerate(record, budget)?,
                ExportPhase::Archive => self.export_archive(record, budget)?,
                ExportPhase::Finalize => self.export_finalize(record, budget)?,
                ExportPhase::Complete => true,
            };
            if !done {
                return Ok(());
            }

            record.advance_progress(phase.percent_range().1);
            record.phase = Phase::Export(phase.next());
            tracing::debug!(job_id = %record.id, from = ?phase, to = ?phase.next(), "Export phase finished");
        }
    }

    fn exclusion_policy(&self, options: &ExportOptions) -> ExclusionPolicy {
        ExclusionPolicy::build(
            options,
            self.registry.as_ref(),
            &self.config.site.content_dir,
            &[self.config.storage.dir.as_path()],
            &self.config.archive.extra_exclusions,
        )
    }

    fn job_file(&self, record: &JobRecord, name: &str) -> PathBuf {
        self.store.job_dir(&record.id).join(name)
    }

    fn options_of(record: &JobRecord) -> Result<ExportOptions> {
        record
            .export_options()
            .cloned()
            .ok_or_else(|| ArchiverError::Phase(format!("job {} carries no export options", record.id)))
    }

    fn export_config(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let options = Self::options_of(record)?;
        let policy = self.exclusion_policy(&options);
        let document = ConfigDocument {
            archive_id: record.id.clone(),
            created_at: record.created_at.clone(),
            source: self.source_info(),
            options,
            active_themes: self.config.registry.active_themes.clone(),
            active_plugins: self.config.registry.active_plugins.clone(),
            exclusions: policy.entries().map(str::to_string).collect(),
        };
        std::fs::write(self.job_file(record, CONFIG_DOCUMENT_FILE), document.to_pretty_json()?)?;
        budget.record_unit();
        Ok(true)
    }

    fn export_database(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let options = Self::options_of(record)?;
        if !options.include_database {
            record.has_database = false;
            return Ok(true);
        }

        let dumper = DatabaseDumper::new(&self.config.site.database_path, self.config.dump.batch_rows)
            .with_external_binary(self.config.dump.external_binary.clone())
            .with_filters(RowFilter::from_options(&options));
        let out = self.job_file(record, DUMP_FILE);
        let done = dumper.dump_slice(&mut record.dump, budget, &out)?;

        record.interpolate_progress(
            ExportPhase::Database.percent_range(),
            record.dump.table_index as u64,
            record.dump.total_tables as u64,
        );
        if done {
            record.has_database = true;
            let size = std::fs::metadata(&out).map(|m| m.len()).unwrap_or(0);
            tracing::info!(job_id = %record.id, tables = record.dump.total_tables, size = %format_bytes(size), "Database dumped");
        }
        Ok(done)
    }

    fn export_enumerate(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let options = Self::options_of(record)?;
        let policy = self.exclusion_policy(&options);
        let walk = WalkOptions {
            follow_links: self.config.archive.follow_links,
            max_depth: self.config.archive.max_depth,
        };
        let totals = walker::enumerate_to_manifest(
            &self.config.site.content_dir,
            &policy,
            &walk,
            &self.job_file(record, MANIFEST_FILE),
        )?;

        record.total_files = totals.file_count;
        record.total_bytes = totals.total_bytes;
        budget.record_unit();
        tracing::info!(
            job_id = %record.id,
            files = totals.file_count,
            size = %format_bytes(totals.total_bytes),
            "Content enumerated"
        );
        Ok(true)
    }

    fn export_archive(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let manifest = self.job_file(record, MANIFEST_FILE);
        let config_document = self.job_file(record, CONFIG_DOCUMENT_FILE);
        let dump = self.job_file(record, DUMP_FILE);
        let container = self.catalog.container_path_for(&record.id)?;
        let inputs = BuildInputs {
            content_dir: &self.config.site.content_dir,
            manifest: &manifest,
            config_document: &config_document,
            dump: record.has_database.then_some(dump.as_path()),
            container: &container,
        };

        let done = build_slice(self.backend.as_ref(), &inputs, &mut record.build, budget)?;
        record.interpolate_progress(
            ExportPhase::Archive.percent_range(),
            record.build.archived_files + record.build.skipped_files,
            record.total_files,
        );
        Ok(done)
    }

    fn export_finalize(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let container = self.catalog.container_path_for(&record.id)?;
        let size = container_size(&container);
        if size == 0 {
            return Err(ArchiverError::Phase(format!(
                "Container missing or empty: {}",
                container.display()
            )));
        }

        let metadata = ArchiveMetadata {
            id: record.id.clone(),
            created_at: record.created_at.clone(),
            completed_at: chrono::Utc::now().to_rfc3339(),
            source: self.source_info(),
            source_tag: SourceTag::Local,
            container: container
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size,
            options: Self::options_of(record)?,
            file_count: record.build.archived_files,
            total_bytes: record.build.archived_bytes,
            has_database: record.has_database,
        };
        self.catalog.save(&metadata)?;
        record.completed = true;
        budget.record_unit();

        if let Err(e) = self.store.remove(&record.id) {
            tracing::warn!(job_id = %record.id, error = %e, "Failed to remove export working directory");
        }
        let pruned = self.catalog.apply_retention(self.config.storage.retention);

        tracing::info!(
            job_id = %record.id,
            files = metadata.file_count,
            skipped = record.build.skipped_files,
            size = %format_bytes(size),
            pruned = pruned.len(),
            "Export complete"
        );
        Ok(true)
    }
}

fn container_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
