//! Versioned schema for the history database.
//!
//! Each migration runs inside its own transaction and is recorded in
//! `schema_version`, so reopening an up-to-date database is a no-op.

use rusqlite::{Connection, OptionalExtension, params};

use crate::entry::epoch_millis;
use crate::error::{Error, Result, StorageStage};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up_sql: &'static str,
}

pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "entries, mime types and reference-counted data",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS entries (
                    position INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    creation_time INTEGER NOT NULL,
                    last_used_time INTEGER NOT NULL,
                    starred INTEGER NOT NULL DEFAULT 0 CHECK(starred IN (0, 1)),
                    clipboard_label TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_entries_clipboard
                    ON entries(clipboard_label, position);

                CREATE TABLE IF NOT EXISTS data (
                    data_id TEXT PRIMARY KEY,           -- sha256 hex of the bytes
                    ref_count INTEGER NOT NULL CHECK(ref_count >= 0)
                );

                CREATE TABLE IF NOT EXISTS mime_types (
                    entry_id TEXT NOT NULL,
                    mime_type TEXT NOT NULL CHECK(length(mime_type) > 0),
                    data_id TEXT NOT NULL,
                    PRIMARY KEY (entry_id, mime_type),
                    FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE RESTRICT,
                    FOREIGN KEY (data_id) REFERENCES data(data_id) ON DELETE RESTRICT
                );

                CREATE INDEX IF NOT EXISTS idx_mime_types_data ON mime_types(data_id);
            "#,
        },
        Migration {
            version: 2,
            description: "persist per-clipboard history indexes",
            // Existing rows are numbered 0.. in insertion order per clipboard.
            up_sql: r#"
                ALTER TABLE entries ADD COLUMN history_index INTEGER NOT NULL DEFAULT 0;

                UPDATE entries SET history_index = (
                    SELECT COUNT(*) FROM entries AS older
                    WHERE older.clipboard_label = entries.clipboard_label
                      AND older.position < entries.position
                );
            "#,
        },
    ]
}

/// Bring `conn` up to [`CURRENT_SCHEMA_VERSION`].
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let open = |e: rusqlite::Error| Error::storage(StorageStage::Open, e);

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )
    .map_err(open)?;

    let current: i64 = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()
        .map_err(open)?
        .flatten()
        .unwrap_or(0);

    if current > CURRENT_SCHEMA_VERSION {
        return Err(Error::storage(
            StorageStage::Open,
            format!("database schema v{current} is newer than supported v{CURRENT_SCHEMA_VERSION}"),
        ));
    }

    for migration in migrations().into_iter().filter(|m| m.version > current) {
        let tx = conn.transaction().map_err(open)?;
        tx.execute_batch(migration.up_sql).map_err(open)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, epoch_millis() as i64],
        )
        .map_err(open)?;
        tx.commit().map_err(open)?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }

    Ok(())
}
