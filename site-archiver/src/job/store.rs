//! Progress store: one JSON document per job under its working directory.
//!
//! Last writer wins. Callers drive a job id from one thread of control at a
//! time.

use super::{validate_job_id, JobRecord};
use std::fs;
use std::path::{Path, PathBuf};

const RECORD_FILE: &str = "progress.json";

#[derive(Debug, Clone)]
pub struct ProgressStore {
    jobs_dir: PathBuf,
}

impl ProgressStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id)
    }

    /// Create the job's working directory. Failure here is a setup failure.
    pub fn ensure_job_dir(&self, job_id: &str) -> crate::Result<PathBuf> {
        validate_job_id(job_id)?;
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).map_err(|e| {
            crate::ArchiverError::Setup(format!(
                "cannot create working directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(dir)
    }

    /// Persist a record. Returns false when it could not be written.
    pub fn save(&self, job_id: &str, record: &JobRecord) -> bool {
        if validate_job_id(job_id).is_err() {
            tracing::warn!(job_id = %job_id, "Refusing to save record for invalid job id");
            return false;
        }
        let dir = self.job_dir(job_id);
        let result = (|| -> crate::Result<()> {
            fs::create_dir_all(&dir)?;
            let tmp = dir.join(format!("{}.tmp", RECORD_FILE));
            fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
            fs::rename(&tmp, dir.join(RECORD_FILE))?;
            Ok(())
        })();

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to save job record");
                false
            }
        }
    }

    /// Load a record; missing or corrupt documents read as None.
    pub fn load(&self, job_id: &str) -> Option<JobRecord> {
        validate_job_id(job_id).ok()?;
        let path = self.job_dir(job_id).join(RECORD_FILE);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Ignoring corrupt job record");
                None
            }
        }
    }

    /// Delete the job's working directory and everything in it.
    pub fn remove(&self, job_id: &str) -> crate::Result<bool> {
        validate_job_id(job_id)?;
        let dir = self.job_dir(job_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Ids of all job directories, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.jobs_dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|id| validate_job_id(id).is_ok())
            .collect();
        ids.sort();
        ids
    }
}
