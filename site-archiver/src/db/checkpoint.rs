//! Rollback checkpoints taken before a restore overwrites the database.

use crate::job::{new_job_id, validate_job_id};
use crate::{ArchiverError, Result};
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "checkpoint-";

pub trait CheckpointProvider {
    /// Snapshot the current database; returns the checkpoint id.
    fn create(&self) -> Result<String>;

    /// Put a snapshot back in place of the current database.
    fn restore(&self, id: &str) -> Result<()>;
}

/// Copies the database file into the checkpoint directory and keeps the
/// newest `retention` copies.
#[derive(Debug, Clone)]
pub struct FileCheckpointProvider {
    database_path: PathBuf,
    dir: PathBuf,
    retention: usize,
}

impl FileCheckpointProvider {
    pub fn new(database_path: impl Into<PathBuf>, dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            database_path: database_path.into(),
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_job_id(id)?;
        Ok(self.dir.join(format!("{}.db", id)))
    }

    fn prune(&self) -> Result<()> {
        let mut checkpoints: Vec<_> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(CHECKPOINT_PREFIX))
            .collect();

        // Ids start with a UTC timestamp, so name order is age order.
        checkpoints.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

        for old in checkpoints.into_iter().skip(self.retention) {
            let _ = std::fs::remove_file(old.path());
            tracing::info!("[Checkpoint] Removed old checkpoint: {}", old.file_name().to_string_lossy());
        }
        Ok(())
    }
}

impl CheckpointProvider for FileCheckpointProvider {
    fn create(&self) -> Result<String> {
        if !self.database_path.is_file() {
            return Err(ArchiverError::Phase(format!(
                "Nothing to checkpoint, database file missing: {}",
                self.database_path.display()
            )));
        }
        std::fs::create_dir_all(&self.dir)?;

        let id = format!("{}{}", CHECKPOINT_PREFIX, new_job_id());
        let target = self.path_for(&id)?;
        std::fs::copy(&self.database_path, &target)?;
        tracing::info!("[Checkpoint] Created checkpoint: {}", id);

        if let Err(e) = self.prune() {
            tracing::warn!("[Checkpoint] Failed to prune old checkpoints: {}", e);
        }
        Ok(id)
    }

    fn restore(&self, id: &str) -> Result<()> {
        let source = self.path_for(id)?;
        if !source.is_file() {
            return Err(ArchiverError::Phase(format!("Checkpoint not found: {}", id)));
        }
        copy_replacing(&source, &self.database_path)?;
        tracing::info!("[Checkpoint] Restored checkpoint: {}", id);
        Ok(())
    }
}

/// Copy via a sibling temp file so the target is never half-written.
fn copy_replacing(source: &Path, target: &Path) -> Result<()> {
    let tmp = target.with_extension("restore-tmp");
    std::fs::copy(source, &tmp)?;
    std::fs::rename(&tmp, target)?;
    Ok(())
}
