//! Resumable statement-replay dump of the site database.
//!
//! The dump is one UTF-8 text file: `--` comment header, then
//! `PRAGMA foreign_keys = OFF;`, per table a drop/create pair followed by one
//! `INSERT` per line, and finally `PRAGMA foreign_keys = ON;`. Every
//! statement ends with `;` at end of line. Schema statements copied from
//! `sqlite_master` may span lines; the loader joins lines until the engine
//! reports a complete statement.

use crate::db::{engine_version, load_dump_file, open, quote_ident};
use crate::job::DumpCursor;
use crate::options::ExportOptions;
use crate::pipeline::SliceBudget;
use crate::Result;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const PRAGMA_OFF: &str = "PRAGMA foreign_keys = OFF;";
pub const PRAGMA_ON: &str = "PRAGMA foreign_keys = ON;";

/// Rows dropped from the dump after fetching, before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    /// Applies to tables whose name ends with this suffix (table prefixes vary)
    pub table_suffix: String,
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn from_options(options: &ExportOptions) -> Vec<RowFilter> {
        let mut filters = Vec::new();
        if options.exclude_spam_comments {
            filters.push(RowFilter {
                table_suffix: "comments".into(),
                column: "comment_approved".into(),
                value: "spam".into(),
            });
        }
        if options.exclude_post_revisions {
            filters.push(RowFilter {
                table_suffix: "posts".into(),
                column: "post_type".into(),
                value: "revision".into(),
            });
        }
        filters
    }

    fn applies_to(&self, table: &str) -> bool {
        table.ends_with(&self.table_suffix)
    }
}

pub struct DatabaseDumper {
    database_path: PathBuf,
    batch_rows: usize,
    external_binary: Option<String>,
    filters: Vec<RowFilter>,
}

impl DatabaseDumper {
    pub fn new(database_path: impl Into<PathBuf>, batch_rows: usize) -> Self {
        Self {
            database_path: database_path.into(),
            batch_rows: batch_rows.max(1),
            external_binary: None,
            filters: Vec::new(),
        }
    }

    pub fn with_external_binary(mut self, binary: Option<String>) -> Self {
        self.external_binary = binary;
        self
    }

    pub fn with_filters(mut self, filters: Vec<RowFilter>) -> Self {
        self.filters = filters;
        self
    }

    /// Advance the dump by as many units as the budget allows.
    ///
    /// Returns true once the dump file is complete. The cursor is the only
    /// state carried between slices; `out` is appended to.
    pub fn dump_slice(&self, cursor: &mut DumpCursor, budget: &SliceBudget, out: &Path) -> Result<bool> {
        if cursor.finished {
            return Ok(true);
        }
        if !self.database_path.is_file() {
            return Err(crate::ArchiverError::Phase(format!(
                "Database file not found: {}",
                self.database_path.display()
            )));
        }

        let conn = open(&self.database_path)?;
        let tables = list_tables(&conn)?;
        cursor.total_tables = tables.len();

        if !cursor.external_attempted {
            cursor.external_attempted = true;
            if self.try_external_dump(&tables, out)? {
                budget.record_unit();
                cursor.table_index = tables.len();
                cursor.row_offset = 0;
                cursor.finished = true;
                return Ok(true);
            }
            let mut writer = BufWriter::new(File::create(out)?);
            write_header(&mut writer, "built-in")?;
            writeln!(writer, "{}", PRAGMA_OFF)?;
            writer.flush()?;
        }

        let mut writer = BufWriter::new(OpenOptions::new().append(true).open(out)?);

        loop {
            let Some(table) = tables.get(cursor.table_index) else {
                write_views(&conn, &mut writer)?;
                writeln!(writer, "{}", PRAGMA_ON)?;
                writer.flush()?;
                cursor.row_offset = 0;
                cursor.finished = true;
                return Ok(true);
            };

            if budget.should_yield() {
                writer.flush()?;
                tracing::debug!(
                    table = %table,
                    table_index = cursor.table_index,
                    row_offset = cursor.row_offset,
                    "Dump slice budget exhausted"
                );
                return Ok(false);
            }

            if cursor.row_offset == 0 {
                write_structure(&conn, table, &mut writer)?;
            }

            let fetched = self.dump_batch(&conn, table, cursor.row_offset, &mut writer)?;
            budget.record_unit();

            if fetched < self.batch_rows {
                write_table_extras(&conn, table, &mut writer)?;
                cursor.row_offset = 0;
                cursor.table_index += 1;
            } else {
                cursor.row_offset += self.batch_rows as u64;
            }
        }
    }

    /// Write one batch of rows; returns the number fetched (before filtering).
    fn dump_batch<W: Write>(&self, conn: &Connection, table: &str, offset: u64, out: &mut W) -> Result<usize> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2",
            quote_ident(table),
            page_order(conn, table)?
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

        let filters: Vec<(usize, &str)> = self
            .filters
            .iter()
            .filter(|f| f.applies_to(table))
            .filter_map(|f| {
                columns
                    .iter()
                    .position(|c| c == &f.column)
                    .map(|idx| (idx, f.value.as_str()))
            })
            .collect();

        let mut rows = stmt.query(params![self.batch_rows as i64, offset as i64])?;
        let mut fetched = 0usize;
        let mut values = Vec::with_capacity(columns.len());

        while let Some(row) = rows.next()? {
            fetched += 1;

            let excluded = filters.iter().any(|(idx, value)| {
                matches!(row.get_ref(*idx), Ok(ValueRef::Text(t)) if t == value.as_bytes())
            });
            if excluded {
                continue;
            }

            values.clear();
            for idx in 0..columns.len() {
                values.push(encode_value(row.get_ref(idx)?));
            }
            writeln!(
                out,
                "INSERT INTO {} ({}) VALUES ({});",
                quote_ident(table),
                column_list,
                values.join(", ")
            )?;
        }

        Ok(fetched)
    }

    /// One-shot dump through the external utility. Only usable on a fresh
    /// dump with no row filters; any failure falls back to the built-in path.
    ///
    /// The utility may be newer than the linked engine and emit SQL the
    /// engine cannot run, so its output is only kept after it replays into a
    /// scratch database without a single failed statement.
    fn try_external_dump(&self, tables: &[String], out: &Path) -> Result<bool> {
        let Some(binary) = self.external_binary.as_deref() else {
            return Ok(false);
        };
        if !self.filters.is_empty() {
            tracing::debug!("Row filters active, skipping external dump utility");
            return Ok(false);
        }

        let output = match Command::new(binary).arg(&self.database_path).arg(".dump").output() {
            Ok(output) => output,
            Err(e) => {
                tracing::info!(binary = %binary, error = %e, "External dump utility unavailable, using built-in dump");
                return Ok(false);
            }
        };
        if !output.status.success() || output.stdout.iter().all(|b| b.is_ascii_whitespace()) {
            tracing::warn!(
                binary = %binary,
                status = %output.status,
                "External dump produced no usable output, using built-in dump"
            );
            return Ok(false);
        }

        let mut writer = BufWriter::new(File::create(out)?);
        write_header(&mut writer, binary)?;
        writeln!(writer, "{}", PRAGMA_OFF)?;
        for table in tables {
            writeln!(writer, "DROP TABLE IF EXISTS {};", quote_ident(table))?;
        }
        writer.write_all(&output.stdout)?;
        if !output.stdout.ends_with(b"\n") {
            writeln!(writer)?;
        }
        writeln!(writer, "{}", PRAGMA_ON)?;
        writer.flush()?;
        drop(writer);

        if !replays_cleanly(out) {
            tracing::warn!(binary = %binary, "External dump does not replay on the linked engine, using built-in dump");
            return Ok(false);
        }

        tracing::info!(binary = %binary, tables = tables.len(), "Database dumped with external utility");
        Ok(true)
    }
}

/// Replay a finished dump into a scratch database next to it.
fn replays_cleanly(dump: &Path) -> bool {
    let scratch = dump.with_extension("verify.db");
    let journal = dump.with_extension("verify.db-journal");
    let _ = fs::remove_file(&scratch);
    let result = load_dump_file(&scratch, dump);
    let _ = fs::remove_file(&scratch);
    let _ = fs::remove_file(&journal);

    match result {
        Ok(report) if report.failed == 0 => true,
        Ok(report) => {
            tracing::debug!(
                failed = report.failed,
                first_failure = report.failures.first().map(String::as_str).unwrap_or(""),
                "Dump replay check failed"
            );
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "Dump replay check errored");
            false
        }
    }
}

/// Column list that gives offset pagination a stable order: the rowid, or
/// the primary key of a WITHOUT ROWID table.
fn page_order(conn: &Connection, table: &str) -> Result<String> {
    let sql: String = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    if !normalized.contains("WITHOUT ROWID") {
        return Ok("rowid".to_string());
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut keys: Vec<(i64, String)> = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
        .filter_map(|r| r.ok())
        .filter(|(pk, _)| *pk > 0)
        .collect();
    keys.sort();
    Ok(keys.iter().map(|(_, name)| quote_ident(name)).collect::<Vec<_>>().join(", "))
}

/// User tables in stable (name) order.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn write_header<W: Write>(out: &mut W, method: &str) -> Result<()> {
    writeln!(out, "-- site-archiver database dump")?;
    writeln!(out, "-- Generated: {}", chrono::Utc::now().to_rfc3339())?;
    writeln!(out, "-- Engine: {}", engine_version())?;
    writeln!(out, "-- Method: {}", method)?;
    writeln!(out)?;
    Ok(())
}

fn write_structure<W: Write>(conn: &Connection, table: &str, out: &mut W) -> Result<()> {
    let sql: String = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    writeln!(out)?;
    writeln!(out, "-- Table {}", table)?;
    writeln!(out, "DROP TABLE IF EXISTS {};", quote_ident(table))?;
    writeln!(out, "{};", sql.trim_end().trim_end_matches(';'))?;
    Ok(())
}

/// Indexes and triggers, emitted after the table's rows.
fn write_table_extras<W: Write>(conn: &Connection, table: &str, out: &mut W) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master WHERE type IN ('index', 'trigger') AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY type, name",
    )?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
    for sql in rows.filter_map(|r| r.ok()) {
        writeln!(out, "{};", sql.trim_end().trim_end_matches(';'))?;
    }
    Ok(())
}

fn write_views<W: Write>(conn: &Connection, out: &mut W) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master WHERE type = 'view' AND sql IS NOT NULL ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for (name, sql) in rows.filter_map(|r| r.ok()) {
        writeln!(out, "DROP VIEW IF EXISTS {};", quote_ident(&name))?;
        writeln!(out, "{};", sql.trim_end().trim_end_matches(';'))?;
    }
    Ok(())
}

/// SQL literal for one value. NULL stays an unquoted `NULL`; text with line
/// breaks is hex-encoded so each statement stays on a single line.
pub fn encode_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_nan() => "NULL".to_string(),
        ValueRef::Real(f) if f.is_infinite() => {
            if f > 0.0 { "9e999".to_string() } else { "-9e999".to_string() }
        }
        ValueRef::Real(f) => format!("{:?}", f),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if !text.contains(['\n', '\r']) => {
                format!("'{}'", text.replace('\'', "''"))
            }
            _ => format!("CAST(X'{}' AS TEXT)", to_hex(bytes)),
        },
        ValueRef::Blob(bytes) => format!("X'{}'", to_hex(bytes)),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(hex, "{:02X}", b);
    }
    hex
}
