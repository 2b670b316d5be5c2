//! Chunked container build from the manifest.

use super::{ContainerBackend, ContainerWriter, CONFIG_ENTRY, CONTENT_PREFIX, DATABASE_ENTRY};
use crate::fs::paths::resolve_within;
use crate::job::BuildCursor;
use crate::pipeline::SliceBudget;
use crate::Result;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Everything one build slice reads from.
#[derive(Debug, Clone, Copy)]
pub struct BuildInputs<'a> {
    pub content_dir: &'a Path,
    pub manifest: &'a Path,
    pub config_document: &'a Path,
    pub dump: Option<&'a Path>,
    pub container: &'a Path,
}

/// Add as much of the manifest as the budget allows.
///
/// The config document and dump are added on the first slice only. Every
/// manifest line is re-validated against the content root before its file
/// is added; rejected lines are counted in `skipped_files` and the build
/// continues. Files the writer drops when it flushes are moved from the
/// archived counts to `skipped_files`. Returns true once the manifest is
/// exhausted.
pub fn build_slice(
    backend: &dyn ContainerBackend,
    inputs: &BuildInputs<'_>,
    cursor: &mut BuildCursor,
    budget: &SliceBudget,
) -> Result<bool> {
    let mut writer = backend.open_writer(inputs.container)?;

    if !cursor.config_added {
        let document = std::fs::read(inputs.config_document)?;
        writer.add_bytes(CONFIG_ENTRY, &document)?;
        cursor.config_added = true;
    }

    if !cursor.database_added {
        if let Some(dump) = inputs.dump {
            if !writer.add_file(DATABASE_ENTRY, dump)? && !writer.contains(DATABASE_ENTRY) {
                return Err(crate::ArchiverError::Phase(format!(
                    "Database dump could not be added: {}",
                    dump.display()
                )));
            }
        }
        cursor.database_added = true;
    }

    let mut manifest = File::open(inputs.manifest)?;
    manifest.seek(SeekFrom::Start(cursor.manifest_offset))?;
    let mut reader = BufReader::new(manifest);
    let mut line = String::new();
    let mut sizes: HashMap<String, u64> = HashMap::new();

    loop {
        if budget.should_yield() {
            close(writer, &sizes, cursor)?;
            tracing::debug!(
                manifest_offset = cursor.manifest_offset,
                archived_files = cursor.archived_files,
                "Archive slice budget exhausted"
            );
            return Ok(false);
        }

        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            close(writer, &sizes, cursor)?;
            return Ok(true);
        }
        cursor.manifest_offset += read as u64;

        let relative = line.trim_end_matches(['\n', '\r']);
        if relative.is_empty() {
            continue;
        }
        budget.record_unit();

        let source = match resolve_within(inputs.content_dir, relative) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %relative, error = %e, "Skipping manifest entry");
                cursor.skipped_files += 1;
                continue;
            }
        };
        let size = std::fs::metadata(&source).map(|m| m.len()).unwrap_or(0);

        let name = format!("{}{}", CONTENT_PREFIX, relative);
        if writer.add_file(&name, &source)? {
            cursor.archived_files += 1;
            cursor.archived_bytes += size;
            sizes.insert(name, size);
        } else if !writer.contains(&name) {
            cursor.skipped_files += 1;
        }
    }
}

fn close(writer: Box<dyn ContainerWriter>, sizes: &HashMap<String, u64>, cursor: &mut BuildCursor) -> Result<()> {
    for name in writer.finish()? {
        if name == DATABASE_ENTRY {
            return Err(crate::ArchiverError::Phase("Database dump vanished before it was written".into()));
        }
        let Some(size) = sizes.get(&name) else {
            continue;
        };
        tracing::warn!(entry = %name, "File vanished before it was written");
        cursor.archived_files = cursor.archived_files.saturating_sub(1);
        cursor.archived_bytes = cursor.archived_bytes.saturating_sub(*size);
        cursor.skipped_files += 1;
    }
    Ok(())
}
