//! Restore state machine: checkpoint → database → files.

use super::{Pipeline, SliceBudget};
use crate::archive::{extractor, DATABASE_ENTRY};
use crate::db::load_dump_file;
use crate::job::{validate_job_id, JobKind, JobRecord, Phase, RestorePhase};
use crate::options::RestoreOptions;
use crate::utils::format::format_elapsed;
use crate::{ArchiverError, Result};
use std::path::PathBuf;
use std::time::Duration;

const DUMP_SCRATCH_FILE: &str = "database.sql";

impl Pipeline {
    /// Create and persist a restore job for a catalogued archive.
    pub fn init_restore(&self, archive_id: &str, options: RestoreOptions) -> Result<JobRecord> {
        validate_job_id(archive_id)?;
        if self.catalog.file_path(archive_id).is_none() {
            return Err(ArchiverError::ArchiveNotFound(archive_id.to_string()));
        }
        self.ensure_none_in_flight(JobKind::Restore)?;

        let record = JobRecord::new_restore(archive_id, options);
        self.store.ensure_job_dir(&record.id)?;
        if !self.store.save(&record.id, &record) {
            let _ = self.store.remove(&record.id);
            return Err(ArchiverError::Setup(format!("cannot persist job record for {}", record.id)));
        }

        tracing::info!(job_id = %record.id, archive_id = %archive_id, options = ?record.options, "Restore started");
        Ok(record)
    }

    pub fn process_restore_slice(&self, job_id: &str) -> Result<JobRecord> {
        self.restore_slice_with(job_id, self.config.slice_budget())
    }

    pub fn run_restore_to_completion(&self, archive_id: &str, options: RestoreOptions) -> Result<JobRecord> {
        let started = std::time::Instant::now();
        let mut record = self.init_restore(archive_id, options)?;
        while !record.is_terminal() {
            record = self.restore_slice_with(&record.id, self.run_to_completion_budget())?;
        }
        tracing::info!(job_id = %record.id, elapsed = %format_elapsed(started.elapsed()), "Restore run finished");
        Ok(record)
    }

    /// Drop a restore job. Files already written to the site stay.
    pub fn cancel_restore(&self, job_id: &str) -> Result<()> {
        self.cancel_job(job_id, JobKind::Restore)
    }

    fn restore_slice_with(&self, job_id: &str, limit: Duration) -> Result<JobRecord> {
        let mut record = self.load_job(job_id, JobKind::Restore)?;
        if record.is_terminal() {
            return Ok(record);
        }

        let budget = SliceBudget::new(limit);
        match self.drive_restore(&mut record, &budget) {
            Ok(()) => {
                record.touch();
                self.persist(&record);
                tracing::debug!(
                    job_id = %record.id,
                    phase = ?record.phase,
                    percent = record.progress_percent,
                    units = budget.units(),
                    "Restore slice done"
                );
            }
            Err(e) => self.fail_job(&mut record, e),
        }
        Ok(record)
    }

    fn drive_restore(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<()> {
        loop {
            let Phase::Restore(phase) = record.phase else {
                return Err(ArchiverError::Phase(format!("job {} is not a restore", record.id)));
            };
            if phase == RestorePhase::Complete {
                if !record.completed {
                    record.completed = true;
                    tracing::info!(
                        job_id = %record.id,
                        files = record.extract.extracted_files,
                        rejected = record.extract.rejected_entries,
                        statements_ok = record.import.statements_ok,
                        statements_failed = record.import.statements_failed,
                        "Restore complete"
                    );
                }
                return Ok(());
            }
            if budget.should_yield() {
                return Ok(());
            }

            let done = match phase {
                RestorePhase::Checkpoint => self.restore_checkpoint(record, budget)?,
                RestorePhase::Database => self.restore_database(record, budget)?,
                RestorePhase::Files => self.restore_files(record, budget)?,
                RestorePhase::Complete => true,
            };
            if !done {
                return Ok(());
            }

            record.advance_progress(phase.percent_range().1);
            record.phase = Phase::Restore(phase.next());
            tracing::debug!(job_id = %record.id, from = ?phase, to = ?phase.next(), "Restore phase finished");
        }
    }

    fn restore_options_of(record: &JobRecord) -> Result<RestoreOptions> {
        record
            .restore_options()
            .cloned()
            .ok_or_else(|| ArchiverError::Phase(format!("job {} carries no restore options", record.id)))
    }

    fn source_container(&self, record: &JobRecord) -> Result<PathBuf> {
        let archive_id = record
            .source_archive_id
            .as_deref()
            .ok_or_else(|| ArchiverError::Phase(format!("job {} has no source archive", record.id)))?;
        self.catalog
            .file_path(archive_id)
            .ok_or_else(|| ArchiverError::ArchiveNotFound(archive_id.to_string()))
    }

    /// Best effort: a failed checkpoint never blocks the restore.
    fn restore_checkpoint(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let options = Self::restore_options_of(record)?;
        budget.record_unit();
        if !options.restore_database {
            return Ok(true);
        }
        match self.checkpoints.create() {
            Ok(id) => {
                tracing::info!(job_id = %record.id, checkpoint_id = %id, "Checkpoint taken");
                record.checkpoint_id = Some(id);
            }
            Err(e) => {
                tracing::warn!(job_id = %record.id, error = %e, "Checkpoint failed, continuing without rollback point");
            }
        }
        Ok(true)
    }

    fn restore_database(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let options = Self::restore_options_of(record)?;
        if !options.restore_database || record.import.imported {
            return Ok(true);
        }

        let container = self.source_container(record)?;
        let scratch = self.store.job_dir(&record.id).join(DUMP_SCRATCH_FILE);
        budget.record_unit();

        if !extractor::extract_entry_to(&container, DATABASE_ENTRY, &scratch)? {
            tracing::info!(job_id = %record.id, "Archive has no database dump, skipping import");
            record.import.imported = true;
            return Ok(true);
        }

        let result = load_dump_file(&self.config.site.database_path, &scratch);
        if let Err(e) = std::fs::remove_file(&scratch) {
            tracing::warn!(job_id = %record.id, error = %e, "Failed to remove dump scratch file");
        }
        let report = result?;

        record.import.imported = true;
        record.import.statements_ok = report.succeeded;
        record.import.statements_failed = report.failed;

        if !report.is_success() {
            self.roll_back(record);
            return Err(ArchiverError::Phase(format!(
                "Database import failed: {} of {} statements failed",
                report.failed,
                report.succeeded + report.failed
            )));
        }
        Ok(true)
    }

    fn roll_back(&self, record: &JobRecord) {
        let Some(checkpoint_id) = record.checkpoint_id.as_deref() else {
            tracing::warn!(job_id = %record.id, "No checkpoint to roll back to");
            return;
        };
        match self.checkpoints.restore(checkpoint_id) {
            Ok(()) => tracing::info!(job_id = %record.id, checkpoint_id = %checkpoint_id, "Database rolled back"),
            Err(e) => tracing::error!(job_id = %record.id, checkpoint_id = %checkpoint_id, error = %e, "Rollback failed"),
        }
    }

    fn restore_files(&self, record: &mut JobRecord, budget: &SliceBudget) -> Result<bool> {
        let options = Self::restore_options_of(record)?;
        if !options.restore_files {
            return Ok(true);
        }

        let container = self.source_container(record)?;
        let done = self.backend.extract_files(
            &container,
            &self.config.site.content_dir,
            &mut record.extract,
            budget,
        )?;
        record.interpolate_progress(
            RestorePhase::Files.percent_range(),
            record.extract.entry_index as u64,
            record.extract.total_entries as u64,
        );
        Ok(done)
    }
}
