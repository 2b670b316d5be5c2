//! Utility modules for the site archiver.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{ArchiverError, Result};
