//! Relational dump, replay and rollback checkpoints for the site database.

pub mod checkpoint;
pub mod dump;
pub mod load;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub use checkpoint::{CheckpointProvider, FileCheckpointProvider};
pub use dump::{DatabaseDumper, RowFilter};
pub use load::{load_dump, load_dump_file, LoadReport};

/// Open the site database for dumping or replaying.
pub fn open(path: &Path) -> crate::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Version string of the linked SQLite engine.
pub fn engine_version() -> String {
    format!("SQLite {}", rusqlite::version())
}

/// Double-quoted SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
