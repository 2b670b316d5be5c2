//! Custom error types for the site archiver.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Container error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Another {0} job is already in progress: {1}")]
    JobInProgress(String, String),

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Phase(String),
}

pub type Result<T> = std::result::Result<T, ArchiverError>;
