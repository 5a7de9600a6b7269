//! Clipboard registry: every clipboard the daemon runs, keyed by id.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clipboard::{Clipboard, ClipboardId, ClipboardSettings};
use crate::endpoint::{Endpoint, SelectionKind, UpdateNotice};
use crate::error::{Error, Result};
use crate::store::Store;

pub struct Registry {
    clipboards: BTreeMap<ClipboardId, Clipboard>,
    /// Handed to every clipboard; endpoints report updates through it.
    updates: mpsc::UnboundedSender<UpdateNotice>,
}

impl Registry {
    pub fn new(updates: mpsc::UnboundedSender<UpdateNotice>) -> Self {
        Self {
            clipboards: BTreeMap::new(),
            updates,
        }
    }

    /// Create a clipboard and reload its history from `store`.
    ///
    /// Returns `Err(Conflict)` if the label is taken.
    pub fn add(
        &mut self,
        store: &mut Store,
        label: &str,
        settings: ClipboardSettings,
    ) -> Result<ClipboardId> {
        if self.clipboards.values().any(|c| c.label() == label) {
            return Err(Error::Conflict(format!("clipboard {label} already exists")));
        }
        let mut clipboard = Clipboard::new(label, settings, self.updates.clone())?;
        clipboard.load(store)?;
        let id = clipboard.id();
        tracing::info!(clipboard = label, %id, "clipboard added");
        self.clipboards.insert(id, clipboard);
        Ok(id)
    }

    pub fn get(&self, id: ClipboardId) -> Option<&Clipboard> {
        self.clipboards.get(&id)
    }

    pub fn get_mut(&mut self, id: ClipboardId) -> Option<&mut Clipboard> {
        self.clipboards.get_mut(&id)
    }

    pub fn by_label(&self, label: &str) -> Result<&Clipboard> {
        self.clipboards
            .values()
            .find(|c| c.label() == label)
            .ok_or_else(|| Error::NotFound(format!("clipboard {label}")))
    }

    pub fn by_label_mut(&mut self, label: &str) -> Result<&mut Clipboard> {
        self.clipboards
            .values_mut()
            .find(|c| c.label() == label)
            .ok_or_else(|| Error::NotFound(format!("clipboard {label}")))
    }

    /// The clipboard whose history holds `entry_id`.
    pub fn find_entry(&self, entry_id: &str) -> Result<ClipboardId> {
        self.clipboards
            .values()
            .find(|c| c.contains(entry_id))
            .map(Clipboard::id)
            .ok_or_else(|| Error::NotFound(format!("entry {entry_id}")))
    }

    /// Attach `endpoint` for `kind` to the clipboard labelled `clipboard`.
    ///
    /// An endpoint follows one clipboard per selection kind; it is
    /// detached from whichever other clipboard held it first.
    pub fn attach(
        &mut self,
        clipboard: &str,
        label: &str,
        endpoint: Arc<dyn Endpoint>,
        kind: SelectionKind,
    ) -> Result<()> {
        let target = self.by_label(clipboard)?;
        let target_id = target.id();
        if target.is_attached(endpoint.id(), kind)
            || target
                .endpoints()
                .iter()
                .any(|info| info.label == label && info.kind == kind)
        {
            return Err(Error::Conflict(format!(
                "clipboard {clipboard}: endpoint {label} already attached for {kind}"
            )));
        }

        for other in self.clipboards.values_mut() {
            if other.id() == target_id {
                continue;
            }
            if let Some(previous) = other.detach_endpoint(endpoint.id(), kind) {
                tracing::info!(
                    from = other.label(),
                    to = clipboard,
                    endpoint = %previous,
                    selection = %kind,
                    "endpoint moved"
                );
            }
        }

        match self.clipboards.get_mut(&target_id) {
            Some(target) => target.attach(label, endpoint, kind),
            None => Err(Error::NotFound(format!("clipboard {clipboard}"))),
        }
    }

    /// Relabel a clipboard. The new label must be free.
    pub fn rename(&mut self, store: &mut Store, label: &str, new_label: &str) -> Result<()> {
        if label != new_label && self.by_label(new_label).is_ok() {
            return Err(Error::Conflict(format!(
                "clipboard {new_label} already exists"
            )));
        }
        self.by_label_mut(label)?.rename(store, new_label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Clipboard> {
        self.clipboards.values()
    }

    pub fn len(&self) -> usize {
        self.clipboards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clipboards.is_empty()
    }
}
