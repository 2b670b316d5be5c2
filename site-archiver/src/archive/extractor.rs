//! Restore-side extraction.
//!
//! Only `content/` entries are materialized onto the target tree. The
//! config document and the dump are read directly by whoever needs them.

use super::CONTENT_PREFIX;
use crate::fs::paths::sanitize_relative;
use crate::job::ExtractCursor;
use crate::pipeline::SliceBudget;
use crate::{ArchiverError, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub fn open_archive(container: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(container)
        .map_err(|e| ArchiverError::Phase(format!("Cannot open container {}: {}", container.display(), e)))?;
    Ok(ZipArchive::new(file)?)
}

pub fn entry_names(container: &Path) -> Result<Vec<String>> {
    let archive = open_archive(container)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Upper bound for documents read into memory with [`read_entry`].
pub const MAX_DOCUMENT_BYTES: u64 = 1 << 20;

/// Read a top-level entry into memory; None when absent.
///
/// The declared size in the container is not trusted. Entries that inflate
/// past [`MAX_DOCUMENT_BYTES`] are refused with a validation error.
pub fn read_entry(container: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(container)?;
    let result = match archive.by_name(name) {
        Ok(mut entry) => {
            let mut bytes = Vec::new();
            (&mut entry).take(MAX_DOCUMENT_BYTES + 1).read_to_end(&mut bytes)?;
            if bytes.len() as u64 > MAX_DOCUMENT_BYTES {
                return Err(ArchiverError::Validation(format!(
                    "entry '{}' exceeds {} bytes",
                    name, MAX_DOCUMENT_BYTES
                )));
            }
            Some(bytes)
        }
        Err(zip::result::ZipError::FileNotFound) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(result)
}

/// Stream a top-level entry to `dest`; false when absent.
pub fn extract_entry_to(container: &Path, name: &str, dest: &Path) -> Result<bool> {
    let mut archive = open_archive(container)?;
    let result = match archive.by_name(name) {
        Ok(mut entry) => {
            let mut out = File::create(dest)?;
            std::io::copy(&mut entry, &mut out)?;
            true
        }
        Err(zip::result::ZipError::FileNotFound) => false,
        Err(e) => return Err(e.into()),
    };
    Ok(result)
}

/// Extract entries from `cursor.entry_index` on, yielding when the budget
/// runs out. Returns true once every entry has been visited.
pub fn extract_slice(
    container: &Path,
    target: &Path,
    cursor: &mut ExtractCursor,
    budget: &SliceBudget,
) -> Result<bool> {
    let mut archive = open_archive(container)?;
    cursor.total_entries = archive.len();
    fs::create_dir_all(target)?;
    let real_target = target.canonicalize()?;

    while cursor.entry_index < cursor.total_entries {
        if budget.should_yield() {
            tracing::debug!(
                entry_index = cursor.entry_index,
                total_entries = cursor.total_entries,
                "Extract slice budget exhausted"
            );
            return Ok(false);
        }

        let mut entry = archive.by_index(cursor.entry_index)?;
        let meta = EntryMeta {
            name: entry.name().to_string(),
            is_dir: entry.is_dir(),
            unix_mode: entry.unix_mode(),
        };
        match materialize(&meta, &mut entry, &real_target) {
            Ok(Outcome::Written) => cursor.extracted_files += 1,
            Ok(Outcome::Ignored) => {}
            Err(ArchiverError::PathTraversal(reason)) => {
                tracing::warn!(reason = %reason, "Rejected container entry");
                cursor.rejected_entries += 1;
            }
            Err(e) => return Err(e),
        }
        cursor.entry_index += 1;
        budget.record_unit();
    }

    Ok(true)
}

/// Extract everything in one pass.
pub fn extract_all(container: &Path, target: &Path, cursor: &mut ExtractCursor) -> Result<()> {
    extract_slice(container, target, cursor, &SliceBudget::unlimited())?;
    Ok(())
}

enum Outcome {
    Written,
    Ignored,
}

struct EntryMeta {
    name: String,
    is_dir: bool,
    unix_mode: Option<u32>,
}

fn materialize(meta: &EntryMeta, entry: &mut dyn Read, real_target: &Path) -> Result<Outcome> {
    let name = &meta.name;
    let Some(relative) = name.strip_prefix(CONTENT_PREFIX) else {
        return Ok(Outcome::Ignored);
    };
    if relative.trim_matches('/').is_empty() {
        return Ok(Outcome::Ignored);
    }

    let clean = sanitize_relative(relative)?;
    if meta.unix_mode.map(|m| m & S_IFMT == S_IFLNK).unwrap_or(false) {
        return Err(ArchiverError::PathTraversal(format!("symlink entry '{}'", name)));
    }

    let dest = real_target.join(&clean);
    if meta.is_dir {
        prepare_dirs(real_target, &clean, name)?;
        return Ok(Outcome::Ignored);
    }

    let parent_relative = clean.parent().unwrap_or_else(|| Path::new(""));
    prepare_dirs(real_target, parent_relative, name)?;
    if let Ok(existing) = fs::symlink_metadata(&dest) {
        if existing.file_type().is_symlink() {
            return Err(ArchiverError::PathTraversal(format!("'{}' would write through a symlink", name)));
        }
    }
    if let Some(parent) = dest.parent() {
        ensure_inside(real_target, parent, name)?;
    }

    let mut out = File::create(&dest)?;
    std::io::copy(entry, &mut out)?;
    Ok(Outcome::Written)
}

/// Create `relative` below the target one component at a time. Existing
/// components must be real directories; symlinks are never followed.
fn prepare_dirs(real_target: &Path, relative: &Path, name: &str) -> Result<()> {
    let mut current = real_target.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(existing) if existing.file_type().is_symlink() => {
                return Err(ArchiverError::PathTraversal(format!("'{}' passes through a symlink", name)));
            }
            Ok(existing) if existing.is_dir() => {}
            Ok(_) => {
                return Err(ArchiverError::PathTraversal(format!(
                    "'{}' passes through an existing file",
                    name
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match fs::create_dir(&current) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && current.is_dir() => {}
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn ensure_inside(real_target: &Path, dir: &Path, name: &str) -> Result<PathBuf> {
    let real = dir.canonicalize()?;
    if real.starts_with(real_target) {
        Ok(real)
    } else {
        Err(ArchiverError::PathTraversal(format!("'{}' resolves outside the target", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn make_container(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extracts_content_and_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let container = temp_dir.path().join("a.zip");
        let target = temp_dir.path().join("target");
        make_container(
            &container,
            &[
                ("config.json", "{}"),
                ("database.sql", "-- dump"),
                ("content/../../etc/passwd", "evil"),
                ("content/themes/t/style.css", "body{}"),
                ("content/readme.txt", "hi"),
            ],
        );

        let mut cursor = ExtractCursor::default();
        extract_all(&container, &target, &mut cursor).unwrap();

        assert_eq!(cursor.total_entries, 5);
        assert_eq!(cursor.entry_index, 5);
        assert_eq!(cursor.extracted_files, 2);
        assert_eq!(cursor.rejected_entries, 1);
        assert_eq!(fs::read_to_string(target.join("themes/t/style.css")).unwrap(), "body{}");
        assert!(!target.join("config.json").exists());
        assert!(!temp_dir.path().join("etc/passwd").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_symlinks_on_target_are_not_followed() {
        use std::os::unix::fs::symlink;

        let temp_dir = TempDir::new().unwrap();
        let container = temp_dir.path().join("a.zip");
        let target = temp_dir.path().join("target");
        let outside_file = temp_dir.path().join("outside.txt");
        let outside_dir = temp_dir.path().join("outside");
        fs::create_dir_all(&target).unwrap();
        fs::create_dir_all(&outside_dir).unwrap();
        fs::write(&outside_file, "original").unwrap();
        symlink(&outside_file, target.join("evil.txt")).unwrap();
        symlink(&outside_dir, target.join("linked")).unwrap();
        make_container(
            &container,
            &[
                ("content/evil.txt", "OVERWRITTEN"),
                ("content/linked/sub/x.txt", "x"),
                ("content/ok.txt", "fine"),
            ],
        );

        let mut cursor = ExtractCursor::default();
        extract_all(&container, &target, &mut cursor).unwrap();

        assert_eq!(cursor.extracted_files, 1);
        assert_eq!(cursor.rejected_entries, 2);
        assert_eq!(fs::read_to_string(&outside_file).unwrap(), "original");
        assert!(!outside_dir.join("sub").exists());
        assert_eq!(fs::read_to_string(target.join("ok.txt")).unwrap(), "fine");
    }

    #[test]
    fn test_slices_resume_by_entry_index() {
        let temp_dir = TempDir::new().unwrap();
        let container = temp_dir.path().join("a.zip");
        let target = temp_dir.path().join("target");
        make_container(
            &container,
            &[("content/1", "1"), ("content/2", "2"), ("content/3", "3")],
        );

        let mut cursor = ExtractCursor::default();
        let mut slices = 0;
        while !extract_slice(&container, &target, &mut cursor, &SliceBudget::new(Duration::ZERO)).unwrap() {
            slices += 1;
            assert_eq!(cursor.entry_index, slices);
        }
        assert_eq!(cursor.extracted_files, 3);
        assert_eq!(fs::read_to_string(target.join("3")).unwrap(), "3");
    }

    #[test]
    fn test_read_entry() {
        let temp_dir = TempDir::new().unwrap();
        let container = temp_dir.path().join("a.zip");
        make_container(&container, &[("config.json", "{\"a\":1}")]);

        assert_eq!(read_entry(&container, "config.json").unwrap().unwrap(), b"{\"a\":1}");
        assert!(read_entry(&container, "database.sql").unwrap().is_none());

        let dest = temp_dir.path().join("out.sql");
        assert!(!extract_entry_to(&container, "database.sql", &dest).unwrap());
        assert!(open_archive(&temp_dir.path().join("missing.zip")).is_err());
    }

    #[test]
    fn test_read_entry_refuses_oversized_documents() {
        let temp_dir = TempDir::new().unwrap();
        let container = temp_dir.path().join("a.zip");
        let body = " ".repeat(MAX_DOCUMENT_BYTES as usize + 1);
        make_container(&container, &[("config.json", body.as_str())]);

        match read_entry(&container, "config.json") {
            Err(ArchiverError::Validation(msg)) => assert!(msg.contains("exceeds")),
            other => panic!("expected validation error, got {:?}", other.map(|b| b.map(|b| b.len()))),
        }
    }

    fn crc32(bytes: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in bytes {
            crc ^= byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            }
        }
        !crc
    }

    /// A one-entry stored container whose central directory declares
    /// `declared` uncompressed bytes through a zip64 extra field.
    fn container_with_declared_size(name: &str, body: &[u8], declared: u64) -> Vec<u8> {
        let crc = crc32(body);
        let mut out = Vec::new();
        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x21u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(body);

        let central_offset = out.len() as u32;
        out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x21u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&12u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&0x0001u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&declared.to_le_bytes());
        let central_size = out.len() as u32 - central_offset;

        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&central_size.to_le_bytes());
        out.extend_from_slice(&central_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[test]
    fn test_read_entry_ignores_declared_size() {
        let temp_dir = TempDir::new().unwrap();
        let container = temp_dir.path().join("crafted.zip");
        let body = b"{\"archive_id\":\"x\"}";
        fs::write(&container, container_with_declared_size("config.json", body, 1 << 50)).unwrap();

        // Must return instead of reserving the declared size up front.
        match read_entry(&container, "config.json") {
            Ok(Some(bytes)) => assert_eq!(bytes, body),
            Ok(None) => panic!("entry should be present"),
            Err(_) => {}
        }
    }
}
