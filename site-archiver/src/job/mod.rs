//! Job records: the persisted, resumable state of one export or restore.

pub mod store;

use crate::options::{ExportOptions, RestoreOptions};
use serde::{Deserialize, Serialize};

pub use store::ProgressStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Export,
    Restore,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Export => "export",
            JobKind::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Config,
    Database,
    Enumerate,
    Archive,
    Finalize,
    Complete,
}

impl ExportPhase {
    /// Transition taken when the current phase reports it is done.
    pub fn next(self) -> ExportPhase {
        match self {
            ExportPhase::Config => ExportPhase::Database,
            ExportPhase::Database => ExportPhase::Enumerate,
            ExportPhase::Enumerate => ExportPhase::Archive,
            ExportPhase::Archive => ExportPhase::Finalize,
            ExportPhase::Finalize | ExportPhase::Complete => ExportPhase::Complete,
        }
    }

    /// Percent at which the phase starts and ends.
    pub fn percent_range(self) -> (u8, u8) {
        match self {
            ExportPhase::Config => (0, 5),
            ExportPhase::Database => (5, 40),
            ExportPhase::Enumerate => (40, 45),
            ExportPhase::Archive => (45, 95),
            ExportPhase::Finalize => (95, 100),
            ExportPhase::Complete => (100, 100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Checkpoint,
    Database,
    Files,
    Complete,
}

impl RestorePhase {
    pub fn next(self) -> RestorePhase {
        match self {
            RestorePhase::Checkpoint => RestorePhase::Database,
            RestorePhase::Database => RestorePhase::Files,
            RestorePhase::Files | RestorePhase::Complete => RestorePhase::Complete,
        }
    }

    pub fn percent_range(self) -> (u8, u8) {
        match self {
            RestorePhase::Checkpoint => (0, 10),
            RestorePhase::Database => (10, 50),
            RestorePhase::Files => (50, 100),
            RestorePhase::Complete => (100, 100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Export(ExportPhase),
    Restore(RestorePhase),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOptions {
    Export(ExportOptions),
    Restore(RestoreOptions),
}

/// Resumption point of the database dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpCursor {
    pub table_index: usize,
    pub row_offset: u64,
    pub total_tables: usize,
    /// The one-shot external dump has been tried (successfully or not)
    pub external_attempted: bool,
    pub finished: bool,
}

/// Resumption point of the archive build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCursor {
    /// Byte offset into the manifest of the next line to archive
    pub manifest_offset: u64,
    pub config_added: bool,
    pub database_added: bool,
    pub archived_files: u64,
    pub archived_bytes: u64,
    pub skipped_files: u64,
}

/// Resumption point of the restore-side file extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractCursor {
    pub entry_index: usize,
    pub total_entries: usize,
    pub extracted_files: u64,
    pub rejected_entries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    pub imported: bool,
    pub statements_ok: u64,
    pub statements_failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub phase: Phase,
    pub progress_percent: u8,
    pub completed: bool,
    pub error: Option<String>,
    pub options: JobOptions,

    #[serde(default)]
    pub dump: DumpCursor,
    #[serde(default)]
    pub has_database: bool,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub build: BuildCursor,

    #[serde(default)]
    pub source_archive_id: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub import: ImportState,
    #[serde(default)]
    pub extract: ExtractCursor,

    pub created_at: String,
    pub updated_at: String,
}

impl JobRecord {
    pub fn new_export(options: ExportOptions) -> Self {
        Self::new(
            new_job_id(),
            JobKind::Export,
            Phase::Export(ExportPhase::Config),
            JobOptions::Export(options),
        )
    }

    pub fn new_restore(source_archive_id: &str, options: RestoreOptions) -> Self {
        let mut record = Self::new(
            format!("restore-{}", new_job_id()),
            JobKind::Restore,
            Phase::Restore(RestorePhase::Checkpoint),
            JobOptions::Restore(options),
        );
        record.source_archive_id = Some(source_archive_id.to_string());
        record
    }

    fn new(id: String, kind: JobKind, phase: Phase, options: JobOptions) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            kind,
            phase,
            progress_percent: 0,
            completed: false,
            error: None,
            options,
            dump: DumpCursor::default(),
            has_database: false,
            total_files: 0,
            total_bytes: 0,
            build: BuildCursor::default(),
            source_archive_id: None,
            checkpoint_id: None,
            import: ImportState::default(),
            extract: ExtractCursor::default(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Completed or failed; no further slice does any work.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.error.is_some()
    }

    pub fn export_options(&self) -> Option<&ExportOptions> {
        match &self.options {
            JobOptions::Export(options) => Some(options),
            JobOptions::Restore(_) => None,
        }
    }

    pub fn restore_options(&self) -> Option<&RestoreOptions> {
        match &self.options {
            JobOptions::Restore(options) => Some(options),
            JobOptions::Export(_) => None,
        }
    }

    /// Raise the percentage; it never moves backwards.
    pub fn advance_progress(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    /// Linear interpolation inside a phase's percent range.
    pub fn interpolate_progress(&mut self, range: (u8, u8), done: u64, total: u64) {
        let (start, end) = range;
        let span = u64::from(end.saturating_sub(start));
        let within = if total == 0 { 0 } else { span * done.min(total) / total };
        self.advance_progress(start + within as u8);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// `yyyymmdd-HHMMSS-xxxxxxxx`; sortable by creation time.
pub fn new_job_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}

/// Job and archive ids double as directory and file names.
pub fn validate_job_id(id: &str) -> crate::Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(crate::ArchiverError::InvalidJobId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_transitions_are_linear() {
        let mut phase = ExportPhase::Config;
        let mut seen = vec![phase];
        while phase != ExportPhase::Complete {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                ExportPhase::Config,
                ExportPhase::Database,
                ExportPhase::Enumerate,
                ExportPhase::Archive,
                ExportPhase::Finalize,
                ExportPhase::Complete,
            ]
        );
    }

    #[test]
    fn test_restore_transitions_are_linear() {
        assert_eq!(RestorePhase::Checkpoint.next(), RestorePhase::Database);
        assert_eq!(RestorePhase::Database.next(), RestorePhase::Files);
        assert_eq!(RestorePhase::Files.next(), RestorePhase::Complete);
        assert_eq!(RestorePhase::Complete.next(), RestorePhase::Complete);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut record = JobRecord::new_export(ExportOptions::default());
        record.advance_progress(40);
        record.advance_progress(10);
        assert_eq!(record.progress_percent, 40);

        record.interpolate_progress(ExportPhase::Archive.percent_range(), 5, 10);
        assert_eq!(record.progress_percent, 70);

        record.interpolate_progress((0, 100), 1, 0);
        assert_eq!(record.progress_percent, 70);
    }

    #[test]
    fn test_job_id_shape() {
        let id = new_job_id();
        assert!(validate_job_id(&id).is_ok());
        assert_eq!(id.len(), "20260101-000000-abcdef12".len());

        assert!(validate_job_id("../etc").is_err());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id("a/b").is_err());
    }

    #[test]
    fn test_record_serialization_keeps_cursors() {
        let mut record = JobRecord::new_export(ExportOptions::default());
        record.phase = Phase::Export(ExportPhase::Archive);
        record.dump.table_index = 3;
        record.dump.row_offset = 2000;
        record.build.manifest_offset = 4711;
        record.extract.entry_index = 9;

        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
