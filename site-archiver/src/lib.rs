//! Site Archiver Library
//!
//! Resumable, time-sliced export and restore of a site: content tree plus
//! SQLite database, packed into a single ZIP container.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod db;
pub mod fs;
pub mod job;
pub mod options;
pub mod pipeline;
pub mod registry;
pub mod utils;

// Re-export commonly used types
pub use config::ArchiverConfig;
pub use pipeline::Pipeline;
pub use utils::errors::ArchiverError;
pub type Result<T> = std::result::Result<T, ArchiverError>;
