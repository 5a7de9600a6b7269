//! Clipboard: a named group of endpoints sharing one history.
//!
//! A clipboard owns its attachment map and the ordered history of entry
//! ids (newest first). Entry bytes live in the [`Store`]; the history
//! keeps ids and indexes only.
//!
//! Updates follow `Idle → Updating → Idle`. While an update is in
//! flight, further notifications and activations are queued and handed
//! out one at a time by [`Clipboard::finish_update`], so history
//! mutation and endpoint delivery are serialized per clipboard. The daemon loop drives the pieces
//! ([`Clipboard::request_update`], [`capture`], [`Clipboard::commit`],
//! [`FanOut::deliver`]); [`Clipboard::on_update`] runs them inline.

mod update;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;

use crate::endpoint::{Endpoint, EndpointId, SelectionKind, UpdateListener, UpdateNotice};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::store::{Retain, Store};

pub use update::{DeliveryReport, FanOut, Snapshot, UpdateJob, capture};
use update::Target;

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);

/// Process-unique clipboard identifier. Stable across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipboardId(u64);

impl ClipboardId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClipboardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb{}", self.0)
    }
}

/// Validated per-clipboard settings.
#[derive(Debug, Clone)]
pub struct ClipboardSettings {
    pub max_entries: usize,
    /// Offered mime types must match one of these. Empty allows all.
    pub allowed_mime_types: Vec<Regex>,
    /// Groups of interchangeable mime types.
    pub mime_aliases: Vec<Vec<String>>,
    /// Deadline for each endpoint transfer.
    pub transfer_timeout: Duration,
}

impl Default for ClipboardSettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            allowed_mime_types: Vec::new(),
            mime_aliases: Vec::new(),
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

impl ClipboardSettings {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    pub fn allows(&self, mime_type: &str) -> bool {
        self.allowed_mime_types.is_empty()
            || self.allowed_mime_types.iter().any(|re| re.is_match(mime_type))
    }

    /// The alias group containing `mime_type`, or an empty slice.
    pub fn aliases_of(&self, mime_type: &str) -> &[String] {
        self.mime_aliases
            .iter()
            .find(|group| group.iter().any(|m| m == mime_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// One attached endpoint.
struct Attachment {
    label: String,
    endpoint: Arc<dyn Endpoint>,
    kind: SelectionKind,
}

/// Listing row for [`Clipboard::endpoints`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub label: String,
    pub id: EndpointId,
    pub transport: &'static str,
    pub kind: SelectionKind,
}

/// Work waiting for the clipboard to leave `Updating`.
enum Queued {
    Notice(UpdateNotice),
    Activation(FanOut),
}

/// Next piece of work handed out by [`Clipboard::finish_update`]. The
/// clipboard stays `Updating` until it is done.
pub enum Work {
    Capture(UpdateJob),
    Deliver(FanOut),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryItem {
    id: String,
    index: u64,
}

pub struct Clipboard {
    id: ClipboardId,
    label: String,
    settings: ClipboardSettings,
    /// Newest first.
    history: VecDeque<HistoryItem>,
    attachments: Vec<Attachment>,
    updates: mpsc::UnboundedSender<UpdateNotice>,
    updating: bool,
    queue: VecDeque<Queued>,
}

impl Clipboard {
    /// Create an empty clipboard. Update notices from its endpoints are
    /// sent to `updates`.
    pub fn new(
        label: &str,
        settings: ClipboardSettings,
        updates: mpsc::UnboundedSender<UpdateNotice>,
    ) -> Result<Self> {
        if label.trim().is_empty() {
            return Err(Error::Validation("clipboard label is empty".into()));
        }
        if settings.max_entries == 0 {
            return Err(Error::Validation(format!(
                "clipboard {label}: max_entries must be at least 1"
            )));
        }
        Ok(Self {
            id: ClipboardId::new(),
            label: label.to_string(),
            settings,
            history: VecDeque::new(),
            attachments: Vec::new(),
            updates,
            updating: false,
            queue: VecDeque::new(),
        })
    }

    pub fn id(&self) -> ClipboardId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn settings(&self) -> &ClipboardSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn is_updating(&self) -> bool {
        self.updating
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.history.iter().any(|item| item.id == entry_id)
    }

    /// History index of `entry_id`.
    pub fn index_of(&self, entry_id: &str) -> Option<u64> {
        self.history
            .iter()
            .find(|item| item.id == entry_id)
            .map(|item| item.index)
    }

    /// Entry ids, newest first.
    pub fn entry_ids(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(|item| item.id.as_str())
    }

    // -- Startup --

    /// Rebuild history from the store, then trim it to `max_entries`.
    pub fn load(&mut self, store: &mut Store) -> Result<()> {
        self.history = store
            .clipboard_history(&self.label)?
            .into_iter()
            .map(|(id, index)| HistoryItem { id, index })
            .collect();
        self.evict(store)?;
        tracing::info!(
            clipboard = %self.label,
            entries = self.history.len(),
            "history loaded"
        );
        Ok(())
    }

    // -- Attachments --

    /// Register `endpoint` under `label` for `kind` and subscribe to its
    /// updates.
    ///
    /// One endpoint may sit under the same label once per selection
    /// kind. Fails with [`Error::Conflict`] if the label is taken for
    /// `kind` or the endpoint is already attached here for `kind`.
    /// Moving an endpoint from another clipboard is the registry's job;
    /// it detaches first.
    pub fn attach(
        &mut self,
        label: &str,
        endpoint: Arc<dyn Endpoint>,
        kind: SelectionKind,
    ) -> Result<()> {
        if label.trim().is_empty() {
            return Err(Error::Validation("endpoint label is empty".into()));
        }
        if self.attachments.iter().any(|a| a.label == label && a.kind == kind) {
            return Err(Error::Conflict(format!(
                "clipboard {}: endpoint label {label} already in use for {kind}",
                self.label
            )));
        }
        if self.is_attached(endpoint.id(), kind) {
            return Err(Error::Conflict(format!(
                "clipboard {}: endpoint {} already attached for {kind}",
                self.label,
                endpoint.id()
            )));
        }

        endpoint.subscribe(kind, Some(UpdateListener::new(self.id, self.updates.clone())));
        tracing::info!(
            clipboard = %self.label,
            endpoint = label,
            transport = endpoint.transport(),
            selection = %kind,
            "endpoint attached"
        );
        self.attachments.push(Attachment {
            label: label.to_string(),
            endpoint,
            kind,
        });
        Ok(())
    }

    pub fn is_attached(&self, endpoint: EndpointId, kind: SelectionKind) -> bool {
        self.attachments
            .iter()
            .any(|a| a.endpoint.id() == endpoint && a.kind == kind)
    }

    /// Detach whatever attachment holds `endpoint` for `kind`.
    /// Returns its label.
    pub fn detach_endpoint(&mut self, endpoint: EndpointId, kind: SelectionKind) -> Option<String> {
        let pos = self
            .attachments
            .iter()
            .position(|a| a.endpoint.id() == endpoint && a.kind == kind)?;
        let attachment = self.attachments.remove(pos);
        let label = attachment.label.clone();
        self.release(attachment);
        Some(label)
    }

    fn release(&mut self, attachment: Attachment) {
        attachment.endpoint.subscribe(attachment.kind, None);
        let id = attachment.endpoint.id();
        self.queue.retain(|queued| {
            !matches!(queued, Queued::Notice(n) if n.endpoint == id && n.kind == attachment.kind)
        });
        tracing::info!(
            clipboard = %self.label,
            endpoint = %attachment.label,
            selection = %attachment.kind,
            "endpoint detached"
        );
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.attachments
            .iter()
            .map(|a| EndpointInfo {
                label: a.label.clone(),
                id: a.endpoint.id(),
                transport: a.endpoint.transport(),
                kind: a.kind,
            })
            .collect()
    }

    // -- Update pipeline --

    /// Accept an update notice.
    ///
    /// Returns a job when the clipboard was idle (it is now updating).
    /// While updating, the notice is queued, with duplicates collapsed,
    /// and `None` is returned. Notices from endpoints that are no longer
    /// attached are dropped.
    pub fn request_update(&mut self, notice: UpdateNotice) -> Option<UpdateJob> {
        let Some(attachment) = self
            .attachments
            .iter()
            .find(|a| a.endpoint.id() == notice.endpoint && a.kind == notice.kind)
        else {
            tracing::debug!(
                clipboard = %self.label,
                endpoint = %notice.endpoint,
                "update from detached endpoint ignored"
            );
            return None;
        };

        if self.updating {
            let duplicate = self
                .queue
                .iter()
                .any(|queued| matches!(queued, Queued::Notice(n) if *n == notice));
            if !duplicate {
                tracing::debug!(
                    clipboard = %self.label,
                    endpoint = %attachment.label,
                    queued = self.queue.len() + 1,
                    "update queued"
                );
                self.queue.push_back(Queued::Notice(notice));
            }
            return None;
        }

        tracing::debug!(
            clipboard = %self.label,
            endpoint = %attachment.label,
            selection = %notice.kind,
            "update started"
        );
        self.updating = true;
        Some(UpdateJob {
            clipboard: self.id,
            endpoint: Arc::clone(&attachment.endpoint),
            kind: notice.kind,
            settings: self.settings.clone(),
        })
    }

    /// Seal, persist and record a captured snapshot, then evict.
    ///
    /// On error nothing changes: the history is untouched and the entry
    /// is discarded. Returns the fan-out to every other endpoint
    /// attached for the snapshot's kind.
    pub fn commit(&mut self, store: &mut Store, snapshot: Snapshot) -> Result<FanOut> {
        let Snapshot {
            clipboard,
            endpoint,
            kind,
            content,
        } = snapshot;
        if clipboard != self.id {
            return Err(Error::Validation(format!(
                "clipboard {}: snapshot belongs to {clipboard}",
                self.label
            )));
        }
        let entry = match content {
            None => Entry::cleared(&self.label, Some(endpoint)),
            Some(content) => Entry::new(&self.label, content, Some(endpoint))?,
        };

        let index = store.serialize_entry(&entry)?;
        self.history.push_front(HistoryItem {
            id: entry.id().to_string(),
            index,
        });
        tracing::debug!(
            clipboard = %self.label,
            entry = entry.id(),
            index,
            mime_types = entry.mime_types().count(),
            bytes = entry.byte_size(),
            "entry recorded"
        );

        // The entry is committed; a failed trim only delays eviction.
        if let Err(e) = self.evict(store) {
            tracing::warn!(clipboard = %self.label, error = %e, "eviction failed");
        }

        let targets = self
            .attachments
            .iter()
            .filter(|a| a.kind == kind && a.endpoint.id() != endpoint)
            .map(|a| Target {
                label: a.label.clone(),
                endpoint: Arc::clone(&a.endpoint),
                kind: a.kind,
            })
            .collect();
        Ok(FanOut {
            clipboard: self.id,
            entry: Arc::new(entry),
            targets,
            timeout: self.settings.transfer_timeout,
        })
    }

    /// Leave `Updating`. Returns the next queued work, if any, in which
    /// case the clipboard stays `Updating`.
    pub fn finish_update(&mut self) -> Option<Work> {
        self.updating = false;
        while let Some(queued) = self.queue.pop_front() {
            match queued {
                Queued::Notice(notice) => {
                    if let Some(job) = self.request_update(notice) {
                        return Some(Work::Capture(job));
                    }
                }
                Queued::Activation(fan_out) => {
                    self.updating = true;
                    return Some(Work::Deliver(fan_out));
                }
            }
        }
        None
    }

    /// Process one update notification start to finish.
    ///
    /// Returns the id of the recorded entry, or `None` when the update
    /// was ignored or queued.
    pub async fn on_update(
        &mut self,
        store: &mut Store,
        endpoint: EndpointId,
        kind: SelectionKind,
    ) -> Result<Option<String>> {
        let notice = UpdateNotice {
            clipboard: self.id,
            endpoint,
            kind,
        };
        let Some(job) = self.request_update(notice) else {
            return Ok(None);
        };
        let outcome = self.run(store, job).await;

        let mut next = self.finish_update();
        while let Some(work) = next {
            match work {
                Work::Capture(job) => {
                    if let Err(e) = self.run(store, job).await {
                        tracing::warn!(clipboard = %self.label, error = %e, "queued update failed");
                    }
                }
                Work::Deliver(fan_out) => {
                    fan_out.deliver().await;
                }
            }
            next = self.finish_update();
        }
        outcome
    }

    async fn run(&mut self, store: &mut Store, job: UpdateJob) -> Result<Option<String>> {
        let Some(snapshot) = capture(job).await? else {
            return Ok(None);
        };
        let fan_out = self.commit(store, snapshot)?;
        let id = fan_out.entry().id().to_string();
        fan_out.deliver().await;
        Ok(Some(id))
    }

    /// Trim the store to `max_entries` and drop evicted ids.
    fn evict(&mut self, store: &mut Store) -> Result<()> {
        if self.history.len() <= self.settings.max_entries {
            return Ok(());
        }
        let removed = store.trim(&self.label, Retain::Newest(self.settings.max_entries))?;
        self.forget(&removed);
        if !removed.is_empty() {
            tracing::debug!(
                clipboard = %self.label,
                evicted = removed.len(),
                remaining = self.history.len(),
                "history trimmed"
            );
        }
        Ok(())
    }

    fn forget(&mut self, ids: &[String]) {
        self.history.retain(|item| !ids.contains(&item.id));
    }

    // -- Queries --

    /// Entry `index` places back (0 = most recent).
    pub fn get_entry(&self, store: &Store, index: usize) -> Result<Option<Entry>> {
        match self.history.get(index) {
            Some(item) => store.deserialize_entry(&item.id).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_entry_by_id(&self, store: &Store, id: &str) -> Result<Entry> {
        self.ensure_contains(id)?;
        store.deserialize_entry(id)
    }

    fn ensure_contains(&self, id: &str) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("entry {id} in clipboard {}", self.label)))
        }
    }

    // -- Management --

    /// Pin or unpin an entry. Unpinning may evict immediately.
    pub fn set_starred(&mut self, store: &mut Store, id: &str, starred: bool) -> Result<()> {
        self.ensure_contains(id)?;
        let mut entry = store.deserialize_entry(id)?;
        entry.set_starred(starred);
        store.update_metadata(&entry)?;
        if !starred {
            self.evict(store)?;
        }
        Ok(())
    }

    /// Remove one entry, starred or not.
    pub fn remove_entry(&mut self, store: &mut Store, id: &str) -> Result<()> {
        self.ensure_contains(id)?;
        store.remove_entry(id)?;
        self.history.retain(|item| item.id != id);
        Ok(())
    }

    /// Drop every unstarred entry. Returns how many were removed.
    pub fn clear(&mut self, store: &mut Store) -> Result<usize> {
        let removed = store.trim(&self.label, Retain::Nothing)?;
        self.forget(&removed);
        tracing::info!(clipboard = %self.label, removed = removed.len(), "history cleared");
        Ok(removed.len())
    }

    /// Make an older entry current again: bump its last-used time and
    /// push it to every attached endpoint.
    ///
    /// Delivery takes the clipboard through `Updating` like an update
    /// does. Returns the fan-out to run now, or `None` when it was
    /// queued behind the update in flight.
    pub fn activate(&mut self, store: &mut Store, id: &str) -> Result<Option<FanOut>> {
        self.ensure_contains(id)?;
        let mut entry = store.deserialize_entry(id)?;
        entry.touch();
        store.update_metadata(&entry)?;

        let targets = self
            .attachments
            .iter()
            .map(|a| Target {
                label: a.label.clone(),
                endpoint: Arc::clone(&a.endpoint),
                kind: a.kind,
            })
            .collect();
        let fan_out = FanOut {
            clipboard: self.id,
            entry: Arc::new(entry),
            targets,
            timeout: self.settings.transfer_timeout,
        };
        if self.updating {
            tracing::debug!(
                clipboard = %self.label,
                entry = id,
                queued = self.queue.len() + 1,
                "activation queued"
            );
            self.queue.push_back(Queued::Activation(fan_out));
            return Ok(None);
        }
        self.updating = true;
        Ok(Some(fan_out))
    }

    /// Relabel the clipboard and its stored entries.
    pub fn rename(&mut self, store: &mut Store, new_label: &str) -> Result<()> {
        if new_label.trim().is_empty() {
            return Err(Error::Validation("clipboard label is empty".into()));
        }
        store.rename_clipboard(&self.label, new_label)?;
        tracing::info!(from = %self.label, to = new_label, "clipboard renamed");
        self.label = new_label.to_string();
        Ok(())
    }
}
