//! Update pipeline pieces that run outside the daemon loop.
//!
//! An update is split so that no transfer ever holds clipboard or store
//! state: [`capture`] pulls content from the source endpoint,
//! `Clipboard::commit` (on the loop) seals and persists the entry, and
//! [`FanOut::deliver`] pushes it to the other endpoints.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::{ClipboardId, ClipboardSettings};
use crate::endpoint::{self, Endpoint, EndpointId, SelectionKind};
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Run an endpoint call under the transfer deadline.
pub(crate) async fn with_deadline<T>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| Error::Transfer(format!("{what} timed out after {limit:?}")))?
}

/// Work order for one accepted update notification.
pub struct UpdateJob {
    pub(super) clipboard: ClipboardId,
    pub(super) endpoint: Arc<dyn Endpoint>,
    pub(super) kind: SelectionKind,
    pub(super) settings: ClipboardSettings,
}

impl UpdateJob {
    pub fn clipboard(&self) -> ClipboardId {
        self.clipboard
    }
}

/// Content read from the source endpoint, ready to be sealed.
#[derive(Debug)]
pub struct Snapshot {
    pub(super) clipboard: ClipboardId,
    pub(super) endpoint: EndpointId,
    pub(super) kind: SelectionKind,
    /// `None` when the endpoint has no selection at all.
    pub(super) content: Option<BTreeMap<String, Bytes>>,
}

/// Pull the current selection from the job's endpoint.
///
/// Each mime type is fetched under the transfer deadline; one failing
/// type is dropped with a warning. No selection and an offer with no
/// mime types both capture as cleared. Returns `Ok(None)` when every
/// offered type is filtered out and
/// [`Error::Transfer`] when the offer itself could not be read or every
/// wanted type failed.
pub async fn capture(job: UpdateJob) -> Result<Option<Snapshot>> {
    let UpdateJob {
        clipboard,
        endpoint,
        kind,
        settings,
    } = job;
    let limit = settings.transfer_timeout;
    let source = endpoint.id();

    let offered = with_deadline(limit, "mime type query", endpoint.mime_types(kind)).await?;
    let Some(offered) = offered.filter(|offered| !offered.is_empty()) else {
        tracing::debug!(%clipboard, endpoint = %source, selection = %kind, "selection cleared");
        return Ok(Some(Snapshot {
            clipboard,
            endpoint: source,
            kind,
            content: None,
        }));
    };

    let wanted: Vec<&String> = offered.iter().filter(|m| settings.allows(m)).collect();
    if wanted.is_empty() {
        tracing::debug!(
            %clipboard,
            endpoint = %source,
            offered = offered.len(),
            "no allowed mime types offered, ignoring update"
        );
        return Ok(None);
    }

    let mut content: BTreeMap<String, Bytes> = BTreeMap::new();
    let mut failures = 0usize;
    for mime in wanted {
        // Already recorded through an alias of an earlier type.
        if content.contains_key(mime.as_str()) {
            continue;
        }
        match with_deadline(limit, mime, endpoint.data(mime, kind)).await {
            Ok(bytes) => {
                for alias in settings.aliases_of(mime) {
                    if alias != mime && settings.allows(alias) {
                        content.insert(alias.clone(), bytes.clone());
                    }
                }
                content.insert(mime.clone(), bytes);
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    %clipboard,
                    endpoint = %source,
                    mime = %mime,
                    error = %e,
                    "dropping mime type"
                );
            }
        }
    }

    if content.is_empty() {
        return Err(Error::Transfer(format!(
            "all {failures} offered mime types failed to transfer"
        )));
    }

    Ok(Some(Snapshot {
        clipboard,
        endpoint: source,
        kind,
        content: Some(content),
    }))
}

/// One endpoint an entry is pushed to.
pub(super) struct Target {
    pub(super) label: String,
    pub(super) endpoint: Arc<dyn Endpoint>,
    pub(super) kind: SelectionKind,
}

/// Outcome of a fan-out.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

/// A committed entry and the endpoints it still has to reach.
pub struct FanOut {
    pub(super) clipboard: ClipboardId,
    pub(super) entry: Arc<Entry>,
    pub(super) targets: Vec<Target>,
    pub(super) timeout: Duration,
}

impl FanOut {
    pub fn clipboard(&self) -> ClipboardId {
        self.clipboard
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn target_labels(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.label.as_str())
    }

    /// Push the entry to every target concurrently.
    ///
    /// A failing endpoint is logged and reported; it never stops the
    /// others.
    pub async fn deliver(self) -> DeliveryReport {
        let FanOut {
            clipboard,
            entry,
            targets,
            timeout,
        } = self;

        let results = futures::future::join_all(targets.into_iter().map(|target| {
            let entry = Arc::clone(&entry);
            async move {
                let result = with_deadline(
                    timeout,
                    "set_entry",
                    endpoint::set_entry(target.endpoint.as_ref(), &entry, target.kind),
                )
                .await;
                (target.label, result)
            }
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (label, result) in results {
            match result {
                Ok(()) => report.delivered.push(label),
                Err(e) => {
                    tracing::warn!(
                        %clipboard,
                        endpoint = %label,
                        entry = entry.id(),
                        error = %e,
                        "failed to deliver entry"
                    );
                    report.failed.push((label, e));
                }
            }
        }
        tracing::debug!(
            %clipboard,
            entry = entry.id(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "fan-out finished"
        );
        report
    }
}
