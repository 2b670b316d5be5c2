//! Admission of externally produced containers into the catalog.

use super::{ArchiveCatalog, ArchiveMetadata, ConfigDocument, SourceInfo, SourceTag};
use crate::archive::{extractor, CONFIG_ENTRY, CONTAINER_EXTENSION, CONTENT_PREFIX, DATABASE_ENTRY};
use crate::job::new_job_id;
use crate::options::ExportOptions;
use crate::{ArchiverError, Result};
use std::fs;
use std::path::Path;

/// Validate an uploaded container and store it under a fresh id.
///
/// The upload is copied, never moved. Source facts and options come from its
/// `config.json` when that parses; otherwise they stay empty or default.
pub fn handle_uploaded_archive(
    catalog: &ArchiveCatalog,
    upload: &Path,
    max_bytes: u64,
    retention: usize,
) -> Result<ArchiveMetadata> {
    let extension_ok = upload
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(CONTAINER_EXTENSION))
        .unwrap_or(false);
    if !extension_ok {
        return Err(ArchiverError::Validation(format!(
            "uploaded file must have a .{} extension",
            CONTAINER_EXTENSION
        )));
    }

    let size = fs::metadata(upload)
        .map_err(|e| ArchiverError::Validation(format!("cannot read uploaded file: {}", e)))?
        .len();
    if size > max_bytes {
        return Err(ArchiverError::Validation(format!(
            "uploaded file is {} bytes, limit is {}",
            size, max_bytes
        )));
    }

    let mut archive = extractor::open_archive(upload)
        .map_err(|e| ArchiverError::Validation(format!("not a readable container: {}", e)))?;

    let mut has_database = false;
    let mut other_entries = 0u64;
    let mut file_count = 0u64;
    let mut total_bytes = 0u64;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| ArchiverError::Validation(format!("corrupt container entry: {}", e)))?;
        let name = entry.name();
        if name == DATABASE_ENTRY {
            has_database = true;
        } else if !entry.is_dir() {
            other_entries += 1;
            if name.starts_with(CONTENT_PREFIX) {
                file_count += 1;
                total_bytes = total_bytes.saturating_add(entry.size());
            }
        }
    }
    drop(archive);

    if !has_database && other_entries == 0 {
        return Err(ArchiverError::Validation(
            "container holds neither a database dump nor any files".into(),
        ));
    }

    let document = read_config_document(upload)?;
    let (source, options, created_at) = match document {
        Some(doc) => (doc.source, doc.options, doc.created_at),
        None => (SourceInfo::default(), ExportOptions::default(), String::new()),
    };

    catalog.ensure_dir()?;
    let id = format!("upload-{}", new_job_id());
    let target = catalog.container_path_for(&id)?;
    fs::copy(upload, &target)?;

    let completed_at = chrono::Utc::now().to_rfc3339();
    let metadata = ArchiveMetadata {
        container: target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        id,
        created_at: if created_at.is_empty() { completed_at.clone() } else { created_at },
        completed_at,
        source,
        source_tag: SourceTag::Uploaded,
        size,
        options,
        file_count,
        total_bytes,
        has_database,
    };

    if let Err(e) = catalog.save(&metadata) {
        let _ = fs::remove_file(&target);
        return Err(e);
    }
    tracing::info!(archive_id = %metadata.id, size = size, has_database = has_database, "Accepted uploaded archive");

    catalog.apply_retention(retention);
    Ok(metadata)
}

/// Unreadable or unparsable documents are ignored; oversized ones reject the
/// upload.
fn read_config_document(container: &Path) -> Result<Option<ConfigDocument>> {
    let bytes = match extractor::read_entry(container, CONFIG_ENTRY) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(e @ ArchiverError::Validation(_)) => return Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "Cannot read config document from upload");
            return Ok(None);
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(document) => Ok(Some(document)),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unparsable config document in upload");
            Ok(None)
        }
    }
}
