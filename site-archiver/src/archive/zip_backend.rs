//! ZIP container backends.
//!
//! `IncrementalZipBackend` keeps one writer open for the slice and appends
//! each file as it arrives. `BatchedZipBackend` only supports bulk adds: it
//! buffers pending entries and writes them with one append-open per batch.

use super::{extractor, ContainerBackend, ContainerWriter};
use crate::config::BackendKind;
use crate::job::ExtractCursor;
use crate::pipeline::SliceBudget;
use crate::Result;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Entries at or above this size need ZIP64 headers.
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

fn entry_options(size: u64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size >= LARGE_FILE_THRESHOLD)
}

/// Names already stored in an existing container.
fn existing_names(path: &Path) -> Result<HashSet<String>> {
    if !has_content(path) {
        return Ok(HashSet::new());
    }
    let archive = ZipArchive::new(File::open(path)?)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Open for appending, or start a new container.
fn open_zip(path: &Path) -> Result<ZipWriter<File>> {
    if has_content(path) {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(ZipWriter::new_append(file)?)
    } else {
        Ok(ZipWriter::new(File::create(path)?))
    }
}

/// Stream one source file into the open entry. Returns false when the
/// source cannot be opened (vanished or unreadable since enumeration).
fn write_file_entry(zip: &mut ZipWriter<File>, name: &str, source: &Path) -> Result<bool> {
    let mut reader = match File::open(source) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %source.display(), error = %e, "Skipping unreadable file");
            return Ok(false);
        }
    };
    let size = reader.metadata().map(|m| m.len()).unwrap_or(0);
    zip.start_file(name, entry_options(size))?;
    std::io::copy(&mut reader, zip)?;
    Ok(true)
}

// ── Incremental ──

#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalZipBackend;

impl ContainerBackend for IncrementalZipBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Incremental
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn open_writer(&self, container: &Path) -> Result<Box<dyn ContainerWriter>> {
        let names = existing_names(container)?;
        let zip = open_zip(container)?;
        Ok(Box::new(IncrementalWriter { zip, names }))
    }

    fn extract_files(
        &self,
        container: &Path,
        target: &Path,
        cursor: &mut ExtractCursor,
        budget: &SliceBudget,
    ) -> Result<bool> {
        extractor::extract_slice(container, target, cursor, budget)
    }
}

struct IncrementalWriter {
    zip: ZipWriter<File>,
    names: HashSet<String>,
}

impl ContainerWriter for IncrementalWriter {
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<bool> {
        if self.names.contains(name) {
            return Ok(false);
        }
        self.zip.start_file(name, entry_options(bytes.len() as u64))?;
        std::io::Write::write_all(&mut self.zip, bytes)?;
        self.names.insert(name.to_string());
        Ok(true)
    }

    fn add_file(&mut self, name: &str, source: &Path) -> Result<bool> {
        if self.names.contains(name) {
            return Ok(false);
        }
        let added = write_file_entry(&mut self.zip, name, source)?;
        if added {
            self.names.insert(name.to_string());
        }
        Ok(added)
    }

    fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(&mut self.zip)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<String>> {
        self.zip.finish()?;
        Ok(Vec::new())
    }
}

// ── Batched ──

#[derive(Debug, Clone, Copy)]
pub struct BatchedZipBackend {
    batch_size: usize,
}

impl BatchedZipBackend {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl ContainerBackend for BatchedZipBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Batched
    }

    fn supports_random_access(&self) -> bool {
        false
    }

    fn open_writer(&self, container: &Path) -> Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(BatchedWriter {
            path: container.to_path_buf(),
            batch_size: self.batch_size,
            names: existing_names(container)?,
            pending: Vec::with_capacity(self.batch_size),
            dropped: Vec::new(),
        }))
    }

    /// One-shot: no resumption, the budget is not consulted.
    fn extract_files(
        &self,
        container: &Path,
        target: &Path,
        cursor: &mut ExtractCursor,
        _budget: &SliceBudget,
    ) -> Result<bool> {
        extractor::extract_all(container, target, cursor)?;
        Ok(true)
    }
}

enum Pending {
    Bytes(String, Vec<u8>),
    File(String, PathBuf),
}

struct BatchedWriter {
    path: PathBuf,
    batch_size: usize,
    names: HashSet<String>,
    pending: Vec<Pending>,
    /// Queued files that could not be read when their batch was written
    dropped: Vec<String>,
}

impl BatchedWriter {
    fn queue(&mut self, name: &str, entry: Pending) -> Result<bool> {
        if self.names.contains(name) {
            return Ok(false);
        }
        self.names.insert(name.to_string());
        self.pending.push(entry);
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(true)
    }
}

impl ContainerWriter for BatchedWriter {
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<bool> {
        self.queue(name, Pending::Bytes(name.to_string(), bytes.to_vec()))
    }

    fn add_file(&mut self, name: &str, source: &Path) -> Result<bool> {
        if !source.is_file() {
            tracing::warn!(path = %source.display(), "Skipping unreadable file");
            return Ok(false);
        }
        self.queue(name, Pending::File(name.to_string(), source.to_path_buf()))
    }

    fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut zip = open_zip(&self.path)?;
        for entry in self.pending.drain(..) {
            match entry {
                Pending::Bytes(name, bytes) => {
                    zip.start_file(name.as_str(), entry_options(bytes.len() as u64))?;
                    std::io::Write::write_all(&mut zip, &bytes)?;
                }
                Pending::File(name, source) => {
                    if !write_file_entry(&mut zip, &name, &source)? {
                        self.names.remove(&name);
                        self.dropped.push(name);
                    }
                }
            }
        }
        zip.finish()?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<String>> {
        self.flush()?;
        Ok(std::mem::take(&mut self.dropped))
    }
}
