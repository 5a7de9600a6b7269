//! Content store: reference-counted, content-addressed history storage.
//!
//! Relational metadata (`entries`, `mime_types`, `data`) lives in SQLite;
//! payload bytes live in a [`BlobArea`] keyed by checksum. Every
//! mutating operation runs inside one scoped transaction ([`Txn`]):
//! dropping it without `commit` rolls everything back.
//!
//! Blob bytes are written before commit and deleted after it. Bytes a
//! transaction wrote are removed again if it rolls back, so a failed
//! write leaves no file behind; deletions wait for commit so a rollback
//! never loses referenced bytes.
//!
//! The store is single-writer. It is owned by the daemon loop and never
//! shared between tasks.

pub mod blob;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::entry::{Entry, EntryData};
use crate::error::{Error, Result, StorageStage};

pub use blob::{BlobArea, FileBlobArea, MemoryBlobArea, checksum};

/// File name of the metadata database inside the data directory.
pub const DATABASE_FILE: &str = "history.db";
/// Directory holding one file per blob inside the data directory.
pub const BLOB_DIR: &str = "data";

/// How much history [`Store::trim`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
    /// Keep the newest `n` entries; older unstarred entries are removed.
    Newest(usize),
    /// Remove every unstarred entry.
    Nothing,
}

fn stage(stage: StorageStage) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::storage(stage, e)
}

const PREPARE: StorageStage = StorageStage::Prepare;
const EXEC: StorageStage = StorageStage::Exec;
const STEP: StorageStage = StorageStage::Step;

/// Entry row without its mime types.
struct EntryRow {
    id: String,
    creation_time: u64,
    last_used_time: u64,
    starred: bool,
    clipboard: String,
}

const ENTRY_COLUMNS: &str = "id, creation_time, last_used_time, starred, clipboard_label";

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            creation_time: row.get::<_, i64>(1)?.max(0) as u64,
            last_used_time: row.get::<_, i64>(2)?.max(0) as u64,
            starred: row.get(3)?,
            clipboard: row.get(4)?,
        })
    }
}

pub struct Store {
    conn: Connection,
    blobs: Box<dyn BlobArea>,
}

impl Store {
    /// Open the file-backed store under `dir`:
    /// `<dir>/history.db` plus `<dir>/data/<checksum>`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::storage(StorageStage::Open, format!("create {}: {e}", dir.display()))
        })?;
        let conn = Connection::open(dir.join(DATABASE_FILE))
            .map_err(stage(StorageStage::Open))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(stage(StorageStage::Open))?;
        tracing::debug!(journal_mode = %mode, "opened history database");

        let blobs = FileBlobArea::open(dir.join(BLOB_DIR))?;
        let mut store = Self::with_parts(conn, Box::new(blobs))?;
        let swept = store.sweep_orphans()?;
        if swept > 0 {
            tracing::info!(swept, "removed orphaned blobs");
        }
        Ok(store)
    }

    /// In-memory database and blob area, for ephemeral mode and tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(stage(StorageStage::Open))?;
        Self::with_parts(conn, Box::new(MemoryBlobArea::new()))
    }

    /// Assemble a store from an open connection and any blob backend.
    pub fn with_parts(mut conn: Connection, blobs: Box<dyn BlobArea>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(stage(StorageStage::Open))?;
        schema::migrate(&mut conn)?;
        Ok(Self { conn, blobs })
    }

    fn begin(&mut self) -> Result<Txn<'_>> {
        let tx = self.conn.transaction().map_err(stage(EXEC))?;
        Ok(Txn {
            tx,
            changes: BlobChanges {
                blobs: &mut *self.blobs,
                written: BTreeSet::new(),
                doomed: BTreeSet::new(),
                committed: false,
            },
        })
    }

    // -- Blob primitives --

    /// Take one reference on `bytes`, storing them if new.
    pub fn ref_blob(&mut self, bytes: &[u8]) -> Result<String> {
        let data_id = checksum(bytes);
        let mut txn = self.begin()?;
        txn.ref_blob(&data_id, bytes)?;
        txn.commit()?;
        Ok(data_id)
    }

    /// Drop one reference on `data_id`; the last one deletes the blob.
    ///
    /// Fails (and changes nothing) while mapping rows still point at a
    /// blob whose count would reach zero.
    pub fn unref_blob(&mut self, data_id: &str) -> Result<()> {
        let mut txn = self.begin()?;
        txn.unref_blob(data_id)?;
        txn.commit()
    }

    /// Reference count of `data_id`, or `None` without a `data` row.
    pub fn blob_ref_count(&self, data_id: &str) -> Result<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT ref_count FROM data WHERE data_id = ?1")
            .map_err(stage(PREPARE))?;
        let count: Option<i64> = stmt
            .query_row(params![data_id], |row| row.get(0))
            .optional()
            .map_err(stage(STEP))?;
        Ok(count.map(|c| c.max(0) as u64))
    }

    /// Whether the blob bytes for `data_id` are present.
    pub fn blob_exists(&self, data_id: &str) -> Result<bool> {
        self.blobs.contains(data_id)
    }

    // -- Entries --

    /// Persist `entry` (insert or update) in one transaction.
    ///
    /// Mapping reconciliation: rows for mime types the entry no longer
    /// has are removed and unreferenced; each current mime type takes a
    /// reference on its blob, and a replaced blob is unreferenced only
    /// after the new mapping row is in place.
    ///
    /// Returns the entry's history index. A new entry gets one past the
    /// highest index in its clipboard, or 0 if the clipboard has no
    /// stored entries; an existing entry keeps its index.
    pub fn serialize_entry(&mut self, entry: &Entry) -> Result<u64> {
        let mut txn = self.begin()?;
        let index = txn.upsert_entry(entry)?;

        let existing = txn.mappings(entry.id())?;
        for (mime, old_id) in &existing {
            if !entry.has_mime_type(mime) {
                txn.delete_mapping(entry.id(), mime)?;
                txn.unref_blob(old_id)?;
            }
        }

        for (mime, data) in entry.mappings() {
            let old = existing.get(mime);
            if old.map(String::as_str) == Some(data.data_id()) {
                continue;
            }
            txn.ref_blob(data.data_id(), data.bytes())?;
            txn.upsert_mapping(entry.id(), mime, data.data_id())?;
            if let Some(old_id) = old {
                txn.unref_blob(old_id)?;
            }
        }

        txn.commit()?;
        Ok(index)
    }

    /// Persist only `starred` and `last_used_time`.
    pub fn update_metadata(&mut self, entry: &Entry) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE entries SET starred = ?2, last_used_time = ?3 WHERE id = ?1")
            .map_err(stage(PREPARE))?;
        let changed = stmt
            .execute(params![
                entry.id(),
                entry.is_starred(),
                entry.last_used_time() as i64
            ])
            .map_err(stage(EXEC))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("entry {}", entry.id())));
        }
        Ok(())
    }

    /// Load an entry by id.
    pub fn deserialize_entry(&self, id: &str) -> Result<Entry> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"))
            .map_err(stage(PREPARE))?;
        let row = stmt
            .query_row(params![id], EntryRow::from_row)
            .optional()
            .map_err(stage(STEP))?
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        self.load(row)
    }

    /// Load the entry `index` places back in `clipboard`'s history
    /// (0 = most recent).
    pub fn deserialize_entry_at(&self, clipboard: &str, index: usize) -> Result<Entry> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE clipboard_label = ?1
                 ORDER BY position DESC LIMIT 1 OFFSET ?2"
            ))
            .map_err(stage(PREPARE))?;
        let row = stmt
            .query_row(params![clipboard, index as i64], EntryRow::from_row)
            .optional()
            .map_err(stage(STEP))?
            .ok_or_else(|| Error::NotFound(format!("entry {index} of clipboard {clipboard}")))?;
        self.load(row)
    }

    /// Attach mime types and bytes to an entry row. A blob referenced by
    /// several mime types is read once and shared.
    fn load(&self, row: EntryRow) -> Result<Entry> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT mime_type, data_id FROM mime_types WHERE entry_id = ?1")
            .map_err(stage(PREPARE))?;
        let pairs = stmt
            .query_map(params![row.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(stage(STEP))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(stage(STEP))?;

        let mut loaded: HashMap<String, Bytes> = HashMap::new();
        let mut mimes = BTreeMap::new();
        for (mime, data_id) in pairs {
            let bytes = match loaded.get(&data_id) {
                Some(bytes) => bytes.clone(),
                None => {
                    let bytes = self.blobs.read(&data_id)?;
                    loaded.insert(data_id.clone(), bytes.clone());
                    bytes
                }
            };
            mimes.insert(mime, EntryData::new(data_id, bytes));
        }

        Ok(Entry::restore(
            row.id,
            row.clipboard,
            row.creation_time,
            row.last_used_time,
            row.starred,
            mimes,
        ))
    }

    pub fn entry_exists(&self, id: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM entries WHERE id = ?1")
            .map_err(stage(PREPARE))?;
        stmt.exists(params![id]).map_err(stage(STEP))
    }

    /// `(id, history index)` of `clipboard`'s entries, newest first.
    pub fn clipboard_history(&self, clipboard: &str) -> Result<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, history_index FROM entries WHERE clipboard_label = ?1
                 ORDER BY position DESC",
            )
            .map_err(stage(PREPARE))?;
        stmt.query_map(params![clipboard], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })
        .map_err(stage(STEP))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(stage(STEP))
    }

    /// Remove `clipboard`'s history beyond `retain`, oldest first.
    ///
    /// Starred entries are never removed here, not even by
    /// [`Retain::Nothing`]. Returns the removed ids, oldest first.
    pub fn trim(&mut self, clipboard: &str, retain: Retain) -> Result<Vec<String>> {
        let keep = match retain {
            Retain::Newest(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Retain::Nothing => 0,
        };

        let mut txn = self.begin()?;
        let doomed: Vec<String> = {
            let mut stmt = txn
                .tx
                .prepare_cached(
                    "SELECT id FROM entries
                     WHERE clipboard_label = ?1 AND starred = 0
                       AND position NOT IN (
                           SELECT position FROM entries WHERE clipboard_label = ?1
                           ORDER BY position DESC LIMIT ?2
                       )
                     ORDER BY position ASC",
                )
                .map_err(stage(PREPARE))?;
            stmt.query_map(params![clipboard, keep], |row| row.get(0))
                .map_err(stage(STEP))?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(stage(STEP))?
        };

        for id in &doomed {
            txn.delete_entry(id)?;
        }
        txn.commit()?;
        Ok(doomed)
    }

    /// Explicitly remove one entry, starred or not.
    pub fn remove_entry(&mut self, id: &str) -> Result<()> {
        let mut txn = self.begin()?;
        txn.delete_entry(id)?;
        txn.commit()
    }

    /// Move every entry of `old` to `new`. Returns the number moved.
    pub fn rename_clipboard(&mut self, old: &str, new: &str) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE entries SET clipboard_label = ?2 WHERE clipboard_label = ?1")
            .map_err(stage(PREPARE))?;
        stmt.execute(params![old, new]).map_err(stage(EXEC))
    }

    /// Delete blob bytes that no `data` row accounts for.
    pub fn sweep_orphans(&mut self) -> Result<usize> {
        let mut swept = 0;
        for data_id in self.blobs.ids()? {
            if self.blob_ref_count(&data_id)?.is_none() {
                self.blobs.remove(&data_id)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
impl Store {
    /// Make every later mapping insert abort, after the entry row and
    /// blob bytes of the same transaction are already written.
    pub(crate) fn reject_mappings_for_tests(&self) {
        self.conn
            .execute_batch(
                "CREATE TRIGGER reject_mappings BEFORE INSERT ON mime_types
                 BEGIN SELECT RAISE(ABORT, 'mapping rejected'); END;",
            )
            .unwrap();
    }

    /// Ids of `clipboard`'s entries, newest first.
    pub(crate) fn clipboard_entries(&self, clipboard: &str) -> Result<Vec<String>> {
        Ok(self
            .clipboard_history(clipboard)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }
}

/// Blob side effects of one [`Txn`].
///
/// Deletions wait in `doomed` until [`BlobChanges::apply`]. Bytes this
/// transaction wrote are tracked in `written` and removed on drop unless
/// the transaction committed.
struct BlobChanges<'a> {
    blobs: &'a mut dyn BlobArea,
    written: BTreeSet<String>,
    doomed: BTreeSet<String>,
    committed: bool,
}

impl BlobChanges<'_> {
    fn write(&mut self, data_id: &str, bytes: &[u8]) -> Result<()> {
        // Re-referenced before commit: keep the bytes.
        self.doomed.remove(data_id);
        if !self.blobs.contains(data_id)? {
            self.blobs.write(data_id, bytes)?;
            self.written.insert(data_id.to_string());
        }
        Ok(())
    }

    fn apply(&mut self) {
        self.committed = true;
        for data_id in std::mem::take(&mut self.doomed) {
            // Committed already; a leftover file is swept on next open.
            if let Err(e) = self.blobs.remove(&data_id) {
                tracing::warn!(data_id = %data_id, error = %e, "failed to delete blob bytes");
            }
        }
    }
}

impl Drop for BlobChanges<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for data_id in std::mem::take(&mut self.written) {
            if let Err(e) = self.blobs.remove(&data_id) {
                tracing::warn!(data_id = %data_id, error = %e, "failed to discard blob bytes");
            }
        }
    }
}

/// Scoped write transaction.
///
/// Dropping without [`Txn::commit`] rolls back the SQL side and then
/// discards the blob bytes written under it.
struct Txn<'a> {
    tx: rusqlite::Transaction<'a>,
    changes: BlobChanges<'a>,
}

impl Txn<'_> {
    fn ref_blob(&mut self, data_id: &str, bytes: &[u8]) -> Result<()> {
        let mut stmt = self
            .tx
            .prepare_cached(
                "INSERT INTO data (data_id, ref_count) VALUES (?1, 1)
                 ON CONFLICT(data_id) DO UPDATE SET ref_count = ref_count + 1",
            )
            .map_err(stage(PREPARE))?;
        stmt.execute(params![data_id]).map_err(stage(EXEC))?;
        self.changes.write(data_id, bytes)
    }

    fn unref_blob(&mut self, data_id: &str) -> Result<()> {
        let remaining: Option<i64> = {
            let mut stmt = self
                .tx
                .prepare_cached(
                    "UPDATE data SET ref_count = ref_count - 1
                     WHERE data_id = ?1 AND ref_count > 0
                     RETURNING ref_count",
                )
                .map_err(stage(PREPARE))?;
            stmt.query_row(params![data_id], |row| row.get(0))
                .optional()
                .map_err(stage(STEP))?
        };

        match remaining {
            None => Err(Error::NotFound(format!("data {data_id}"))),
            Some(0) => {
                let mut stmt = self
                    .tx
                    .prepare_cached("DELETE FROM data WHERE data_id = ?1")
                    .map_err(stage(PREPARE))?;
                stmt.execute(params![data_id]).map_err(stage(EXEC))?;
                self.changes.doomed.insert(data_id.to_string());
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Insert or update the entry row. Returns its history index.
    fn upsert_entry(&mut self, entry: &Entry) -> Result<u64> {
        let mut stmt = self
            .tx
            .prepare_cached(
                "INSERT INTO entries
                     (id, creation_time, last_used_time, starred, clipboard_label, history_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, (
                     SELECT COALESCE(MAX(history_index) + 1, 0)
                     FROM entries WHERE clipboard_label = ?5
                 ))
                 ON CONFLICT(id) DO UPDATE SET
                     last_used_time = excluded.last_used_time,
                     starred = excluded.starred,
                     clipboard_label = excluded.clipboard_label
                 RETURNING history_index",
            )
            .map_err(stage(PREPARE))?;
        let index: i64 = stmt
            .query_row(
                params![
                    entry.id(),
                    entry.creation_time() as i64,
                    entry.last_used_time() as i64,
                    entry.is_starred(),
                    entry.clipboard(),
                ],
                |row| row.get(0),
            )
            .map_err(stage(EXEC))?;
        Ok(index.max(0) as u64)
    }

    fn mappings(&mut self, entry_id: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .tx
            .prepare_cached("SELECT mime_type, data_id FROM mime_types WHERE entry_id = ?1")
            .map_err(stage(PREPARE))?;
        stmt.query_map(params![entry_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(stage(STEP))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()
        .map_err(stage(STEP))
    }

    fn upsert_mapping(&mut self, entry_id: &str, mime_type: &str, data_id: &str) -> Result<()> {
        let mut stmt = self
            .tx
            .prepare_cached(
                "INSERT INTO mime_types (entry_id, mime_type, data_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(entry_id, mime_type) DO UPDATE SET data_id = excluded.data_id",
            )
            .map_err(stage(PREPARE))?;
        stmt.execute(params![entry_id, mime_type, data_id])
            .map_err(stage(EXEC))?;
        Ok(())
    }

    fn delete_mapping(&mut self, entry_id: &str, mime_type: &str) -> Result<()> {
        let mut stmt = self
            .tx
            .prepare_cached("DELETE FROM mime_types WHERE entry_id = ?1 AND mime_type = ?2")
            .map_err(stage(PREPARE))?;
        stmt.execute(params![entry_id, mime_type])
            .map_err(stage(EXEC))?;
        Ok(())
    }

    /// Delete an entry: mapping rows first, then their blob references,
    /// then the entry row itself.
    fn delete_entry(&mut self, entry_id: &str) -> Result<()> {
        let mappings = self.mappings(entry_id)?;
        {
            let mut stmt = self
                .tx
                .prepare_cached("DELETE FROM mime_types WHERE entry_id = ?1")
                .map_err(stage(PREPARE))?;
            stmt.execute(params![entry_id]).map_err(stage(EXEC))?;
        }
        for data_id in mappings.values() {
            self.unref_blob(data_id)?;
        }

        let mut stmt = self
            .tx
            .prepare_cached("DELETE FROM entries WHERE id = ?1")
            .map_err(stage(PREPARE))?;
        if stmt.execute(params![entry_id]).map_err(stage(EXEC))? == 0 {
            return Err(Error::NotFound(format!("entry {entry_id}")));
        }
        Ok(())
    }

    fn commit(self) -> Result<()> {
        let Txn { tx, mut changes } = self;
        tx.commit().map_err(stage(EXEC))?;
        changes.apply();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointId;

    fn entry(clipboard: &str, pairs: &[(&str, &[u8])]) -> Entry {
        let content = pairs
            .iter()
            .map(|(m, b)| (m.to_string(), Bytes::copy_from_slice(b)))
            .collect();
        Entry::new(clipboard, content, None).unwrap()
    }

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    // -- Round trip --

    #[test]
    fn serialize_then_deserialize_round_trips() {
        let mut s = store();
        let e = entry("main", &[("text/plain", b"hello"), ("image/png", b"\x89PNG")]);
        s.serialize_entry(&e).unwrap();

        let back = s.deserialize_entry(e.id()).unwrap();
        assert_eq!(back.id(), e.id());
        assert_eq!(back.clipboard(), "main");
        assert_eq!(back.creation_time(), e.creation_time());
        assert_eq!(
            back.mime_types().collect::<Vec<_>>(),
            e.mime_types().collect::<Vec<_>>()
        );
        for mime in e.mime_types() {
            assert_eq!(back.data(mime), e.data(mime));
        }
    }

    #[test]
    fn provenance_is_not_persisted() {
        let mut s = store();
        let mut content = BTreeMap::new();
        content.insert("text/plain".to_string(), Bytes::from_static(b"x"));
        let e = Entry::new("main", content, Some(EndpointId::new())).unwrap();
        s.serialize_entry(&e).unwrap();
        assert_eq!(s.deserialize_entry(e.id()).unwrap().provenance(), None);
    }

    #[test]
    fn cleared_entry_round_trips() {
        let mut s = store();
        let e = Entry::cleared("main", None);
        s.serialize_entry(&e).unwrap();
        assert!(s.deserialize_entry(e.id()).unwrap().is_cleared());
    }

    #[test]
    fn deserialize_missing_entry_is_not_found() {
        let s = store();
        assert!(matches!(
            s.deserialize_entry("nope"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            s.deserialize_entry_at("main", 0),
            Err(Error::NotFound(_))
        ));
        assert!(!s.entry_exists("nope").unwrap());
    }

    #[test]
    fn deserialize_at_index_counts_from_newest() {
        let mut s = store();
        let a = entry("main", &[("text/plain", b"a")]);
        let b = entry("main", &[("text/plain", b"b")]);
        let other = entry("other", &[("text/plain", b"z")]);
        s.serialize_entry(&a).unwrap();
        s.serialize_entry(&other).unwrap();
        s.serialize_entry(&b).unwrap();

        assert_eq!(s.deserialize_entry_at("main", 0).unwrap().id(), b.id());
        assert_eq!(s.deserialize_entry_at("main", 1).unwrap().id(), a.id());
        assert!(s.deserialize_entry_at("main", 2).is_err());
        assert_eq!(
            s.clipboard_entries("main").unwrap(),
            vec![b.id().to_string(), a.id().to_string()]
        );
    }

    #[test]
    fn shared_blob_is_read_once_into_one_buffer() {
        let mut s = store();
        let e = entry("main", &[("text/plain", b"same"), ("UTF8_STRING", b"same")]);
        s.serialize_entry(&e).unwrap();
        let back = s.deserialize_entry(e.id()).unwrap();
        let a = back.data("text/plain").unwrap();
        let b = back.data("UTF8_STRING").unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    // -- Dedup / ref counting --

    #[test]
    fn same_bytes_under_two_mime_types_is_one_blob() {
        let mut s = store();
        let e = entry("main", &[("text/plain", b"dup"), ("TEXT", b"dup")]);
        s.serialize_entry(&e).unwrap();
        let id = checksum(b"dup");
        assert_eq!(s.blob_ref_count(&id).unwrap(), Some(2));
        assert!(s.blob_exists(&id).unwrap());
    }

    #[test]
    fn same_bytes_across_entries_is_one_blob() {
        let mut s = store();
        let a = entry("main", &[("text/plain", b"dup")]);
        let b = entry("main", &[("text/plain", b"dup")]);
        s.serialize_entry(&a).unwrap();
        s.serialize_entry(&b).unwrap();
        let id = checksum(b"dup");
        assert_eq!(s.blob_ref_count(&id).unwrap(), Some(2));

        s.remove_entry(a.id()).unwrap();
        assert_eq!(s.blob_ref_count(&id).unwrap(), Some(1));
        assert!(s.blob_exists(&id).unwrap());

        s.remove_entry(b.id()).unwrap();
        assert_eq!(s.blob_ref_count(&id).unwrap(), None);
        assert!(!s.blob_exists(&id).unwrap());
    }

    #[test]
    fn reserializing_unchanged_entry_keeps_counts() {
        let mut s = store();
        let mut e = entry("main", &[("text/plain", b"x")]);
        s.serialize_entry(&e).unwrap();
        e.set_starred(true);
        s.serialize_entry(&e).unwrap();
        assert_eq!(s.blob_ref_count(&checksum(b"x")).unwrap(), Some(1));
        assert!(s.deserialize_entry(e.id()).unwrap().is_starred());
    }

    #[test]
    fn reserializing_with_changed_mapping_reconciles() {
        let mut s = store();
        let first = entry("main", &[("text/plain", b"old"), ("text/html", b"<b>")]);
        s.serialize_entry(&first).unwrap();

        // Same id, different mapping: text/plain changes, text/html goes away.
        let mut content = BTreeMap::new();
        content.insert("text/plain".to_string(), Bytes::from_static(b"new"));
        let replacement = Entry::restore(
            first.id().to_string(),
            "main".into(),
            first.creation_time(),
            first.last_used_time(),
            false,
            content
                .into_iter()
                .map(|(m, b)| (m, EntryData::new(checksum(&b), b)))
                .collect(),
        );
        s.serialize_entry(&replacement).unwrap();

        assert_eq!(s.blob_ref_count(&checksum(b"old")).unwrap(), None);
        assert_eq!(s.blob_ref_count(&checksum(b"<b>")).unwrap(), None);
        assert_eq!(s.blob_ref_count(&checksum(b"new")).unwrap(), Some(1));
        let back = s.deserialize_entry(first.id()).unwrap();
        assert_eq!(back.mime_types().collect::<Vec<_>>(), vec!["text/plain"]);
        assert_eq!(back.data("text/plain").unwrap().as_ref(), b"new");
    }

    #[test]
    fn moving_bytes_between_mime_types_keeps_blob() {
        let mut s = store();
        let first = entry("main", &[("text/html", b"keep")]);
        s.serialize_entry(&first).unwrap();

        let moved = Entry::restore(
            first.id().to_string(),
            "main".into(),
            first.creation_time(),
            first.last_used_time(),
            false,
            [(
                "text/plain".to_string(),
                EntryData::new(checksum(b"keep"), Bytes::from_static(b"keep")),
            )]
            .into_iter()
            .collect(),
        );
        s.serialize_entry(&moved).unwrap();

        let id = checksum(b"keep");
        assert_eq!(s.blob_ref_count(&id).unwrap(), Some(1));
        assert!(s.blob_exists(&id).unwrap());
    }

    #[test]
    fn ref_and_unref_primitives() {
        let mut s = store();
        let id = s.ref_blob(b"raw").unwrap();
        assert_eq!(id, checksum(b"raw"));
        s.ref_blob(b"raw").unwrap();
        assert_eq!(s.blob_ref_count(&id).unwrap(), Some(2));
        s.unref_blob(&id).unwrap();
        assert!(s.blob_exists(&id).unwrap());
        s.unref_blob(&id).unwrap();
        assert!(!s.blob_exists(&id).unwrap());
        assert!(matches!(s.unref_blob(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn unref_refuses_while_mapping_still_points_at_blob() {
        let mut s = store();
        let e = entry("main", &[("text/plain", b"held")]);
        s.serialize_entry(&e).unwrap();
        let id = checksum(b"held");

        let err = s.unref_blob(&id).unwrap_err();
        assert!(matches!(
            err,
            Error::Storage {
                stage: StorageStage::Exec,
                ..
            }
        ));
        // Rolled back: count and bytes untouched.
        assert_eq!(s.blob_ref_count(&id).unwrap(), Some(1));
        assert!(s.blob_exists(&id).unwrap());
    }

    // -- Trim --

    #[test]
    fn trim_keeps_newest_and_skips_starred() {
        let mut s = store();
        let mut e1 = entry("main", &[("text/plain", b"1")]);
        let e2 = entry("main", &[("text/plain", b"2")]);
        let e3 = entry("main", &[("text/plain", b"3")]);
        let e4 = entry("main", &[("text/plain", b"4")]);
        e1.set_starred(true);
        for e in [&e1, &e2, &e3, &e4] {
            s.serialize_entry(e).unwrap();
        }

        let removed = s.trim("main", Retain::Newest(2)).unwrap();
        assert_eq!(removed, vec![e2.id().to_string()]);
        assert_eq!(
            s.clipboard_entries("main").unwrap(),
            vec![e4.id().to_string(), e3.id().to_string(), e1.id().to_string()]
        );
        assert_eq!(s.blob_ref_count(&checksum(b"2")).unwrap(), None);
        assert!(!s.blob_exists(&checksum(b"2")).unwrap());
    }

    #[test]
    fn trim_nothing_spares_starred_entries() {
        let mut s = store();
        let mut pinned = entry("main", &[("text/plain", b"pin")]);
        pinned.set_starred(true);
        let loose = entry("main", &[("text/plain", b"loose")]);
        s.serialize_entry(&pinned).unwrap();
        s.serialize_entry(&loose).unwrap();

        let removed = s.trim("main", Retain::Nothing).unwrap();
        assert_eq!(removed, vec![loose.id().to_string()]);
        assert!(s.entry_exists(pinned.id()).unwrap());
    }

    #[test]
    fn trim_leaves_other_clipboards_alone() {
        let mut s = store();
        let a = entry("a", &[("text/plain", b"a")]);
        let b = entry("b", &[("text/plain", b"b")]);
        s.serialize_entry(&a).unwrap();
        s.serialize_entry(&b).unwrap();
        s.trim("a", Retain::Nothing).unwrap();
        assert!(s.entry_exists(b.id()).unwrap());
        assert!(!s.entry_exists(a.id()).unwrap());
    }

    #[test]
    fn remove_entry_removes_starred_and_reports_missing() {
        let mut s = store();
        let mut e = entry("main", &[("text/plain", b"x")]);
        e.set_starred(true);
        s.serialize_entry(&e).unwrap();
        s.remove_entry(e.id()).unwrap();
        assert!(!s.entry_exists(e.id()).unwrap());
        assert!(matches!(s.remove_entry(e.id()), Err(Error::NotFound(_))));
    }

    // -- Metadata / rename --

    #[test]
    fn update_metadata_persists_star_and_last_used() {
        let mut s = store();
        let mut e = entry("main", &[("text/plain", b"x")]);
        s.serialize_entry(&e).unwrap();
        e.set_starred(true);
        e.touch();
        s.update_metadata(&e).unwrap();
        let back = s.deserialize_entry(e.id()).unwrap();
        assert!(back.is_starred());
        assert_eq!(back.last_used_time(), e.last_used_time());

        let ghost = entry("main", &[("text/plain", b"y")]);
        assert!(matches!(
            s.update_metadata(&ghost),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rename_clipboard_moves_rows() {
        let mut s = store();
        let e = entry("old", &[("text/plain", b"x")]);
        s.serialize_entry(&e).unwrap();
        assert_eq!(s.rename_clipboard("old", "new").unwrap(), 1);
        assert!(s.clipboard_entries("old").unwrap().is_empty());
        assert_eq!(s.deserialize_entry(e.id()).unwrap().clipboard(), "new");
    }

    // -- File backend --

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry("main", &[("text/plain", b"durable")]);
        {
            let mut s = Store::open(dir.path()).unwrap();
            s.serialize_entry(&e).unwrap();
        }
        assert!(dir.path().join(DATABASE_FILE).is_file());
        assert!(
            dir.path()
                .join(BLOB_DIR)
                .join(checksum(b"durable"))
                .is_file()
        );

        let s = Store::open(dir.path()).unwrap();
        let back = s.deserialize_entry(e.id()).unwrap();
        assert_eq!(back.data("text/plain").unwrap().as_ref(), b"durable");
    }

    #[test]
    fn open_sweeps_orphaned_blob_files() {
        let dir = tempfile::tempdir().unwrap();
        drop(Store::open(dir.path()).unwrap());
        let orphan = checksum(b"crashed before commit");
        std::fs::write(dir.path().join(BLOB_DIR).join(&orphan), b"crashed before commit").unwrap();

        let s = Store::open(dir.path()).unwrap();
        assert!(!s.blob_exists(&orphan).unwrap());
    }

    fn assert_rollback_discards_written_blob(s: &mut Store) {
        let ok = entry("main", &[("text/plain", b"ok")]);
        s.serialize_entry(&ok).unwrap();

        // The entry row and blob bytes land before the mapping insert fails.
        s.reject_mappings_for_tests();
        let doomed = entry("main", &[("text/plain", b"never")]);
        assert!(matches!(
            s.serialize_entry(&doomed),
            Err(Error::Storage { .. })
        ));
        assert!(!s.entry_exists(doomed.id()).unwrap());
        assert_eq!(s.blob_ref_count(&checksum(b"never")).unwrap(), None);
        assert!(!s.blob_exists(&checksum(b"never")).unwrap());

        // Bytes that were already stored survive the rollback.
        assert!(s.blob_exists(&checksum(b"ok")).unwrap());
        assert_eq!(s.blob_ref_count(&checksum(b"ok")).unwrap(), Some(1));
    }

    #[test]
    fn failed_serialize_rolls_back() {
        assert_rollback_discards_written_blob(&mut store());
    }

    #[test]
    fn failed_serialize_leaves_no_blob_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Store::open(dir.path()).unwrap();
        assert_rollback_discards_written_blob(&mut s);
        assert!(!dir.path().join(BLOB_DIR).join(checksum(b"never")).exists());
    }

    #[test]
    fn rollback_keeps_shared_bytes_written_earlier() {
        let mut s = store();
        let first = entry("main", &[("text/plain", b"shared")]);
        s.serialize_entry(&first).unwrap();

        s.reject_mappings_for_tests();
        let second = entry("main", &[("text/html", b"shared")]);
        assert!(s.serialize_entry(&second).is_err());
        assert!(s.blob_exists(&checksum(b"shared")).unwrap());
        assert_eq!(s.blob_ref_count(&checksum(b"shared")).unwrap(), Some(1));
    }

    #[test]
    fn history_indexes_continue_from_highest_stored() {
        let mut s = store();
        let a = entry("main", &[("text/plain", b"a")]);
        let z = entry("other", &[("text/plain", b"z")]);
        let b = entry("main", &[("text/plain", b"b")]);
        assert_eq!(s.serialize_entry(&a).unwrap(), 0);
        assert_eq!(s.serialize_entry(&z).unwrap(), 0);
        assert_eq!(s.serialize_entry(&b).unwrap(), 1);

        // Updating an existing entry keeps its index.
        assert_eq!(s.serialize_entry(&a).unwrap(), 0);

        s.trim("main", Retain::Newest(1)).unwrap();
        let c = entry("main", &[("text/plain", b"c")]);
        assert_eq!(s.serialize_entry(&c).unwrap(), 2);
        assert_eq!(
            s.clipboard_history("main").unwrap(),
            vec![(c.id().to_string(), 2), (b.id().to_string(), 1)]
        );

        s.trim("main", Retain::Nothing).unwrap();
        let d = entry("main", &[("text/plain", b"d")]);
        assert_eq!(s.serialize_entry(&d).unwrap(), 0);
    }
}
