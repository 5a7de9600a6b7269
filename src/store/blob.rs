//! Blob area: write-once byte storage addressed by checksum.
//!
//! Two interchangeable backends: one file per blob under
//! `<data-dir>/data/`, or a map held in memory for ephemeral stores and
//! tests. Reference counting lives in the relational layer; a blob area
//! only stores and deletes bytes.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result, StorageStage};

/// Content address of `bytes`: lowercase hex SHA-256.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Storage backend for blob bytes.
pub trait BlobArea: Send {
    fn contains(&self, data_id: &str) -> Result<bool>;

    /// Store `bytes` under `data_id`. Callers write each id at most once.
    fn write(&mut self, data_id: &str, bytes: &[u8]) -> Result<()>;

    fn read(&self, data_id: &str) -> Result<Bytes>;

    /// Delete a blob. Deleting an absent blob is not an error.
    fn remove(&mut self, data_id: &str) -> Result<()>;

    /// Every stored id, for orphan sweeps.
    fn ids(&self) -> Result<Vec<String>>;
}

/// One file per blob, named by checksum.
#[derive(Debug)]
pub struct FileBlobArea {
    dir: PathBuf,
}

impl FileBlobArea {
    /// Open (creating if needed) the blob directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::storage(
                StorageStage::Open,
                format!("create {}: {e}", dir.display()),
            )
        })?;
        Ok(Self { dir })
    }

    fn path(&self, data_id: &str) -> Result<PathBuf> {
        // Checksums are hex; anything else could escape the directory.
        if data_id.is_empty() || !data_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!("malformed data id: {data_id:?}")));
        }
        Ok(self.dir.join(data_id))
    }
}

impl BlobArea for FileBlobArea {
    fn contains(&self, data_id: &str) -> Result<bool> {
        Ok(self.path(data_id)?.is_file())
    }

    fn write(&mut self, data_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(data_id)?;
        let tmp = self.dir.join(format!(".{data_id}.tmp"));
        let io = |e: std::io::Error| {
            Error::storage(StorageStage::Io, format!("write {}: {e}", path.display()))
        };

        // Temp file + rename so a crash never leaves a truncated blob
        // under its final name.
        let mut file = std::fs::File::create(&tmp).map_err(io)?;
        file.write_all(bytes).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(io)?;
        Ok(())
    }

    fn read(&self, data_id: &str) -> Result<Bytes> {
        let path = self.path(data_id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {data_id}")))
            }
            Err(e) => Err(Error::storage(
                StorageStage::Io,
                format!("read {}: {e}", path.display()),
            )),
        }
    }

    fn remove(&mut self, data_id: &str) -> Result<()> {
        let path = self.path(data_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(
                StorageStage::Io,
                format!("remove {}: {e}", path.display()),
            )),
        }
    }

    fn ids(&self) -> Result<Vec<String>> {
        let io = |e: std::io::Error| {
            Error::storage(StorageStage::Io, format!("list {}: {e}", self.dir.display()))
        };
        let mut ids = Vec::new();
        for dirent in std::fs::read_dir(&self.dir).map_err(io)? {
            let dirent = dirent.map_err(io)?;
            if let Some(name) = dirent.file_name().to_str()
                && !name.starts_with('.')
            {
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }
}

/// Blobs kept in a map, for ephemeral mode and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobArea {
    blobs: HashMap<String, Bytes>,
}

impl MemoryBlobArea {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobArea for MemoryBlobArea {
    fn contains(&self, data_id: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(data_id))
    }

    fn write(&mut self, data_id: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .insert(data_id.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn read(&self, data_id: &str) -> Result<Bytes> {
        self.blobs
            .get(data_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {data_id}")))
    }

    fn remove(&mut self, data_id: &str) -> Result<()> {
        self.blobs.remove(data_id);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.blobs.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    fn exercise(area: &mut dyn BlobArea) {
        let id = checksum(b"payload");
        assert!(!area.contains(&id).unwrap());
        area.write(&id, b"payload").unwrap();
        assert!(area.contains(&id).unwrap());
        assert_eq!(area.read(&id).unwrap().as_ref(), b"payload");
        assert_eq!(area.ids().unwrap(), vec![id.clone()]);
        area.remove(&id).unwrap();
        assert!(!area.contains(&id).unwrap());
        assert!(matches!(area.read(&id), Err(Error::NotFound(_))));
        // Second removal is harmless.
        area.remove(&id).unwrap();
    }

    #[test]
    fn memory_area_contract() {
        exercise(&mut MemoryBlobArea::new());
    }

    #[test]
    fn file_area_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut area = FileBlobArea::open(dir.path().join("data")).unwrap();
        exercise(&mut area);
    }

    #[test]
    fn file_area_uses_checksum_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut area = FileBlobArea::open(dir.path()).unwrap();
        let id = checksum(b"x");
        area.write(&id, b"x").unwrap();
        assert_eq!(std::fs::read(dir.path().join(&id)).unwrap(), b"x");
    }

    #[test]
    fn file_area_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let area = FileBlobArea::open(dir.path()).unwrap();
        assert!(matches!(
            area.contains("../etc/passwd"),
            Err(Error::Validation(_))
        ));
    }
}
