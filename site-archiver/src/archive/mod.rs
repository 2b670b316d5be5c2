//! Container building and extraction.
//!
//! Container layout:
//!
//! | entry                    | content                                  |
//! |--------------------------|------------------------------------------|
//! | `config.json`            | config document, pretty JSON             |
//! | `database.sql`           | optional statement dump                  |
//! | `content/<relative path>`| one entry per manifest line              |

pub mod builder;
pub mod extractor;
pub mod zip_backend;

use crate::config::BackendKind;
use crate::job::ExtractCursor;
use crate::pipeline::SliceBudget;
use crate::Result;
use std::path::Path;

pub use builder::{build_slice, BuildInputs};
pub use zip_backend::{BatchedZipBackend, IncrementalZipBackend};

pub const CONFIG_ENTRY: &str = "config.json";
pub const DATABASE_ENTRY: &str = "database.sql";
pub const CONTENT_PREFIX: &str = "content/";
pub const CONTAINER_EXTENSION: &str = "zip";

/// An open container accepting new entries.
pub trait ContainerWriter {
    /// Add an in-memory entry. Returns false if the name is already present.
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<bool>;

    /// Add a file from disk. Returns false if the name is already present
    /// or the source could not be read.
    fn add_file(&mut self, name: &str, source: &Path) -> Result<bool>;

    fn contains(&self, name: &str) -> bool;

    /// Make everything added so far durable in the container.
    fn flush(&mut self) -> Result<()>;

    /// Flush and close the container. Returns the names that were accepted
    /// but dropped at write time because their source had become unreadable.
    fn finish(self: Box<Self>) -> Result<Vec<String>>;
}

/// Capability interface over the two container backends. Selected once
/// when the pipeline is constructed.
pub trait ContainerBackend {
    fn kind(&self) -> BackendKind;

    /// Whether entries can be extracted by index across slices.
    fn supports_random_access(&self) -> bool;

    fn open_writer(&self, container: &Path) -> Result<Box<dyn ContainerWriter>>;

    /// Extract the `content/` entries of `container` onto `target`.
    /// Returns true when every entry has been processed.
    fn extract_files(
        &self,
        container: &Path,
        target: &Path,
        cursor: &mut ExtractCursor,
        budget: &SliceBudget,
    ) -> Result<bool>;
}

pub fn backend_for(kind: BackendKind, batch_size: usize) -> Box<dyn ContainerBackend> {
    match kind {
        BackendKind::Incremental => Box::new(IncrementalZipBackend),
        BackendKind::Batched => Box::new(BatchedZipBackend::new(batch_size)),
    }
}
