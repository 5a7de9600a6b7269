//! History entries: immutable snapshots of one clipboard update.
//!
//! The mime-type mapping is sealed at construction. Only `starred` and
//! `last_used_time` change afterwards, and neither affects `id`.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::endpoint::EndpointId;
use crate::error::{Error, Result};
use crate::store::checksum;

/// Current time as Unix epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Content for one mime type: its checksum and the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryData {
    data_id: String,
    bytes: Bytes,
}

impl EntryData {
    pub(crate) fn new(data_id: String, bytes: Bytes) -> Self {
        Self { data_id, bytes }
    }

    pub fn data_id(&self) -> &str {
        &self.data_id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    id: String,
    clipboard: String,
    creation_time: u64,
    last_used_time: u64,
    starred: bool,
    mimes: BTreeMap<String, EntryData>,
    /// Endpoint that produced this entry. Never persisted.
    provenance: Option<EndpointId>,
}

impl Entry {
    /// Seal a new entry from fetched selection content.
    ///
    /// Identical payloads under several mime types end up sharing one
    /// buffer. Fails with [`Error::Validation`] on an empty mime type.
    pub fn new(
        clipboard: &str,
        content: BTreeMap<String, Bytes>,
        provenance: Option<EndpointId>,
    ) -> Result<Self> {
        let mut by_id: HashMap<String, Bytes> = HashMap::new();
        let mut mimes = BTreeMap::new();
        for (mime, bytes) in content {
            if mime.trim().is_empty() {
                return Err(Error::Validation("empty mime type".into()));
            }
            let data_id = checksum(&bytes);
            let shared = by_id.entry(data_id.clone()).or_insert(bytes).clone();
            mimes.insert(mime, EntryData::new(data_id, shared));
        }

        Ok(Self::sealed(clipboard, mimes, provenance))
    }

    /// An entry recording that the selection was cleared.
    pub fn cleared(clipboard: &str, provenance: Option<EndpointId>) -> Self {
        Self::sealed(clipboard, BTreeMap::new(), provenance)
    }

    fn sealed(
        clipboard: &str,
        mimes: BTreeMap<String, EntryData>,
        provenance: Option<EndpointId>,
    ) -> Self {
        let now = epoch_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            clipboard: clipboard.to_string(),
            creation_time: now,
            last_used_time: now,
            starred: false,
            mimes,
            provenance,
        }
    }

    /// Rebuild an entry read back from the store.
    pub(crate) fn restore(
        id: String,
        clipboard: String,
        creation_time: u64,
        last_used_time: u64,
        starred: bool,
        mimes: BTreeMap<String, EntryData>,
    ) -> Self {
        Self {
            id,
            clipboard,
            creation_time,
            last_used_time,
            starred,
            mimes,
            provenance: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn clipboard(&self) -> &str {
        &self.clipboard
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn last_used_time(&self) -> u64 {
        self.last_used_time
    }

    pub fn is_starred(&self) -> bool {
        self.starred
    }

    pub fn set_starred(&mut self, starred: bool) {
        self.starred = starred;
    }

    /// Mark the entry as used now.
    pub fn touch(&mut self) {
        self.last_used_time = epoch_millis().max(self.last_used_time);
    }

    pub fn provenance(&self) -> Option<EndpointId> {
        self.provenance
    }

    /// Whether this entry records an empty selection.
    pub fn is_cleared(&self) -> bool {
        self.mimes.is_empty()
    }

    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.mimes.keys().map(String::as_str)
    }

    pub fn has_mime_type(&self, mime_type: &str) -> bool {
        self.mimes.contains_key(mime_type)
    }

    /// Bytes for `mime_type`, straight from memory.
    pub fn data(&self, mime_type: &str) -> Option<&Bytes> {
        self.mimes.get(mime_type).map(EntryData::bytes)
    }

    pub fn data_id(&self, mime_type: &str) -> Option<&str> {
        self.mimes.get(mime_type).map(EntryData::data_id)
    }

    pub fn mappings(&self) -> impl Iterator<Item = (&str, &EntryData)> {
        self.mimes.iter().map(|(m, d)| (m.as_str(), d))
    }

    /// Total payload size, counting shared buffers once.
    pub fn byte_size(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        self.mimes
            .values()
            .filter(|d| seen.insert(d.data_id.as_str()))
            .map(|d| d.bytes.len())
            .sum()
    }
}
