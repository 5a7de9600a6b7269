//! In-process endpoint: a settable selection with failure injection.
//!
//! Used by tests and by `transport = "memory"` in the config, where it
//! acts as a scratch participant that only the control plane can see.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Endpoint, EndpointId, Notifier, SelectionKind, UpdateListener};
use crate::entry::Entry;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    /// Current selection per kind. Absent = no selection.
    selections: HashMap<SelectionKind, BTreeMap<String, Bytes>>,
    failing_mimes: HashSet<String>,
    fail_adopt: bool,
    hang: bool,
    adopted: Vec<(String, SelectionKind)>,
}

#[derive(Debug)]
pub struct MemoryEndpoint {
    id: EndpointId,
    notifier: Notifier,
    state: Mutex<State>,
}

impl Default for MemoryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self {
            id: EndpointId::new(),
            notifier: Notifier::default(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the selection as if a local application copied `content`,
    /// and notify the subscribed clipboard.
    pub fn set_selection(&self, kind: SelectionKind, content: BTreeMap<String, Bytes>) {
        self.state().selections.insert(kind, content);
        self.notifier.notify(self.id, kind);
    }

    /// Shorthand for a single `text/plain` selection.
    pub fn set_text(&self, kind: SelectionKind, text: &str) {
        let mut content = BTreeMap::new();
        content.insert("text/plain".to_string(), Bytes::copy_from_slice(text.as_bytes()));
        self.set_selection(kind, content);
    }

    /// Drop the selection entirely and notify.
    pub fn clear_selection(&self, kind: SelectionKind) {
        self.state().selections.remove(&kind);
        self.notifier.notify(self.id, kind);
    }

    pub fn selection(&self, kind: SelectionKind) -> Option<BTreeMap<String, Bytes>> {
        self.state().selections.get(&kind).cloned()
    }

    /// Make `data` fail for `mime_type` from now on.
    pub fn fail_mime(&self, mime_type: &str) {
        self.state().failing_mimes.insert(mime_type.to_string());
    }

    /// Make every `adopt` fail.
    pub fn set_fail_adopt(&self, fail: bool) {
        self.state().fail_adopt = fail;
    }

    /// Make `mime_types` and `data` never complete.
    pub fn set_hang(&self, hang: bool) {
        self.state().hang = hang;
    }

    /// `(entry id, kind)` of every entry adopted so far, oldest first.
    pub fn adopted(&self) -> Vec<(String, SelectionKind)> {
        self.state().adopted.clone()
    }

    pub fn is_subscribed(&self, kind: SelectionKind) -> bool {
        self.notifier.is_subscribed(kind)
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn transport(&self) -> &'static str {
        "memory"
    }

    fn subscribe(&self, kind: SelectionKind, listener: Option<UpdateListener>) {
        self.notifier.subscribe(kind, listener);
    }

    async fn mime_types(&self, kind: SelectionKind) -> Result<Option<BTreeSet<String>>> {
        let hang = self.state().hang;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(self
            .state()
            .selections
            .get(&kind)
            .map(|content| content.keys().cloned().collect()))
    }

    async fn data(&self, mime_type: &str, kind: SelectionKind) -> Result<Bytes> {
        let hang = self.state().hang;
        if hang {
            std::future::pending::<()>().await;
        }
        let state = self.state();
        if state.failing_mimes.contains(mime_type) {
            return Err(Error::Transfer(format!("{mime_type}: injected failure")));
        }
        state
            .selections
            .get(&kind)
            .and_then(|content| content.get(mime_type))
            .cloned()
            .ok_or_else(|| Error::Transfer(format!("{mime_type} is not offered")))
    }

    async fn adopt(&self, entry: &Entry, kind: SelectionKind) -> Result<()> {
        let mut state = self.state();
        if state.fail_adopt {
            return Err(Error::Transfer("adopt: injected failure".into()));
        }
        if entry.is_cleared() {
            state.selections.remove(&kind);
        } else {
            let content = entry
                .mappings()
                .map(|(mime, data)| (mime.to_string(), data.bytes().clone()))
                .collect();
            state.selections.insert(kind, content);
        }
        state.adopted.push((entry.id().to_string(), kind));
        Ok(())
    }
}
