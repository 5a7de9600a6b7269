//! Endpoint abstraction: pluggable synchronization participants.
//!
//! An endpoint reports the platform selection it observes and accepts
//! entries pushed to it by the owning clipboard. Transports implement
//! [`Endpoint`]; the clipboard only ever talks to `Arc<dyn Endpoint>`.
//!
//! Update notifications flow through an [`UpdateListener`] (a channel
//! sender tagged with the subscribing clipboard). An endpoint holds at
//! most one listener per selection kind, so exactly one clipboard
//! consumes its updates at a time.

pub mod memory;
pub mod x11;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::clipboard::ClipboardId;
use crate::entry::Entry;
use crate::error::{Error, Result};

pub use memory::MemoryEndpoint;
pub use x11::X11Endpoint;

/// Which platform selection an attachment synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    /// The explicit copy/paste clipboard.
    Regular,
    /// The implicit "last highlighted text" selection.
    Primary,
}

impl SelectionKind {
    pub const ALL: [SelectionKind; 2] = [SelectionKind::Regular, SelectionKind::Primary];

    pub fn as_str(self) -> &'static str {
        match self {
            SelectionKind::Regular => "regular",
            SelectionKind::Primary => "primary",
        }
    }
}

impl fmt::Display for SelectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regular" => Ok(SelectionKind::Regular),
            "primary" => Ok(SelectionKind::Primary),
            other => Err(Error::Validation(format!("unknown selection kind: {other}"))),
        }
    }
}

/// Process-unique endpoint identifier.
///
/// Entries remember the id of the endpoint that produced them; this is
/// the only link from an entry back to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

impl EndpointId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// "The selection owned by `endpoint` changed", delivered to the
/// clipboard the endpoint is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateNotice {
    pub clipboard: ClipboardId,
    pub endpoint: EndpointId,
    pub kind: SelectionKind,
}

/// Subscription handle handed to an endpoint on attach.
#[derive(Debug, Clone)]
pub struct UpdateListener {
    clipboard: ClipboardId,
    tx: mpsc::UnboundedSender<UpdateNotice>,
}

impl UpdateListener {
    pub fn new(clipboard: ClipboardId, tx: mpsc::UnboundedSender<UpdateNotice>) -> Self {
        Self { clipboard, tx }
    }

    /// Send a notice. Returns `false` if the receiving loop is gone.
    pub fn notify(&self, endpoint: EndpointId, kind: SelectionKind) -> bool {
        self.tx
            .send(UpdateNotice {
                clipboard: self.clipboard,
                endpoint,
                kind,
            })
            .is_ok()
    }
}

/// Per-kind listener table shared by endpoint implementations.
#[derive(Debug, Default)]
pub struct Notifier {
    listeners: Mutex<HashMap<SelectionKind, UpdateListener>>,
}

impl Notifier {
    /// Replace (or clear, with `None`) the listener for `kind`.
    pub fn subscribe(&self, kind: SelectionKind, listener: Option<UpdateListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        match listener {
            Some(l) => {
                listeners.insert(kind, l);
            }
            None => {
                listeners.remove(&kind);
            }
        }
    }

    pub fn is_subscribed(&self, kind: SelectionKind) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Emit an update for `kind`. Notices without a subscriber are dropped.
    pub fn notify(&self, endpoint: EndpointId, kind: SelectionKind) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(listener) = listeners.get(&kind) else {
            tracing::trace!(%endpoint, selection = %kind, "update without subscriber");
            return;
        };
        if !listener.notify(endpoint, kind) {
            tracing::debug!(%endpoint, selection = %kind, "update listener closed, unsubscribing");
            listeners.remove(&kind);
        }
    }
}

/// Capability set every synchronization participant implements.
///
/// `Send + Sync` is required because transfers and fan-out deliveries
/// run in spawned tasks.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Stable identity used for echo prevention.
    fn id(&self) -> EndpointId;

    /// Short transport name (`"x11"`, `"memory"`) for listings.
    fn transport(&self) -> &'static str;

    /// Route `update(kind)` notifications to `listener`, replacing any
    /// previous subscriber. `None` unsubscribes.
    fn subscribe(&self, kind: SelectionKind, listener: Option<UpdateListener>);

    /// Mime types currently offered. `None` means there is no selection
    /// at all, which is distinct from an empty offer.
    async fn mime_types(&self, kind: SelectionKind) -> Result<Option<BTreeSet<String>>>;

    /// Bytes for one offered mime type. Fails with [`Error::Transfer`]
    /// when the transport breaks.
    async fn data(&self, mime_type: &str, kind: SelectionKind) -> Result<Bytes>;

    /// Make `entry` the platform-visible selection.
    ///
    /// Never called directly; go through [`set_entry`] so the anti-echo
    /// rule holds for every transport.
    async fn adopt(&self, entry: &Entry, kind: SelectionKind) -> Result<()>;
}

/// Push `entry` to `endpoint`.
///
/// A guaranteed no-op when `endpoint` produced `entry`.
pub async fn set_entry(endpoint: &dyn Endpoint, entry: &Entry, kind: SelectionKind) -> Result<()> {
    if entry.provenance() == Some(endpoint.id()) {
        tracing::trace!(
            endpoint = %endpoint.id(),
            entry = entry.id(),
            "skipping echo to source endpoint"
        );
        return Ok(());
    }
    endpoint.adopt(entry, kind).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_kind_parse_and_display() {
        for kind in SelectionKind::ALL {
            assert_eq!(kind.to_string().parse::<SelectionKind>().unwrap(), kind);
        }
        assert!(matches!(
            "secondary".parse::<SelectionKind>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn endpoint_ids_are_unique() {
        let a = EndpointId::new();
        let b = EndpointId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn notifier_routes_to_latest_subscriber() {
        let notifier = Notifier::default();
        let ep = EndpointId::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let c1 = ClipboardId::new();
        let c2 = ClipboardId::new();

        notifier.subscribe(SelectionKind::Regular, Some(UpdateListener::new(c1, tx1)));
        notifier.subscribe(SelectionKind::Regular, Some(UpdateListener::new(c2, tx2)));
        notifier.notify(ep, SelectionKind::Regular);

        assert!(rx1.try_recv().is_err());
        let notice = rx2.try_recv().unwrap();
        assert_eq!(notice.clipboard, c2);
        assert_eq!(notice.endpoint, ep);
        assert_eq!(notice.kind, SelectionKind::Regular);
    }

    #[test]
    fn notifier_without_subscriber_drops_notice() {
        let notifier = Notifier::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.subscribe(
            SelectionKind::Primary,
            Some(UpdateListener::new(ClipboardId::new(), tx)),
        );
        notifier.notify(EndpointId::new(), SelectionKind::Regular);
        assert!(rx.try_recv().is_err());

        notifier.subscribe(SelectionKind::Primary, None);
        assert!(!notifier.is_subscribed(SelectionKind::Primary));
    }

    #[test]
    fn notifier_forgets_closed_listener() {
        let notifier = Notifier::default();
        let (tx, rx) = mpsc::unbounded_channel();
        notifier.subscribe(
            SelectionKind::Regular,
            Some(UpdateListener::new(ClipboardId::new(), tx)),
        );
        drop(rx);
        notifier.notify(EndpointId::new(), SelectionKind::Regular);
        assert!(!notifier.is_subscribed(SelectionKind::Regular));
    }
}
