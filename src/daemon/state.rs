//! Daemon state: registry, store and the update pipeline driver.
//!
//! Owned exclusively by the daemon loop. Transfers run in spawned tasks
//! that report back as [`Progress`]; everything that touches a
//! clipboard or the store happens here, on the loop.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clipboard::{
    ClipboardId, DeliveryReport, FanOut, Snapshot, UpdateJob, Work, capture,
};
use crate::config::{Config, Transport};
use crate::endpoint::{Endpoint, MemoryEndpoint, UpdateNotice, X11Endpoint};
use crate::error::{Error, Result};
use crate::store::Store;

use super::registry::Registry;

/// Report from a spawned pipeline task.
#[derive(Debug)]
pub enum Progress {
    Captured {
        clipboard: ClipboardId,
        result: Result<Option<Snapshot>>,
    },
    /// A fan-out finished; the clipboard's busy period ends.
    Delivered {
        clipboard: ClipboardId,
        report: DeliveryReport,
    },
}

pub struct DaemonState {
    pub registry: Registry,
    pub store: Store,
    config: Config,
    progress: mpsc::UnboundedSender<Progress>,
}

impl DaemonState {
    pub fn new(
        config: Config,
        store: Store,
        updates: mpsc::UnboundedSender<UpdateNotice>,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> Self {
        Self {
            registry: Registry::new(updates),
            store,
            config,
            progress,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the configured clipboards and attach their endpoints.
    ///
    /// An endpoint whose transport cannot be reached is skipped with a
    /// warning; the clipboard still runs with the rest.
    pub fn build(&mut self) -> Result<()> {
        let clipboards = self.config.clipboards.clone();
        for clipboard in &clipboards {
            let settings = self
                .config
                .settings(clipboard)
                .map_err(|e| Error::Validation(e.to_string()))?;
            self.registry
                .add(&mut self.store, &clipboard.label, settings)?;

            for endpoint in &clipboard.endpoints {
                let handle: Arc<dyn Endpoint> = match endpoint.transport {
                    Transport::Memory => Arc::new(MemoryEndpoint::new()),
                    Transport::X11 => match X11Endpoint::connect(endpoint.display.as_deref()) {
                        Ok(x11) => Arc::new(x11),
                        Err(e) => {
                            tracing::warn!(
                                clipboard = %clipboard.label,
                                endpoint = %endpoint.label,
                                error = %e,
                                "endpoint unavailable, skipping"
                            );
                            continue;
                        }
                    },
                };
                for kind in &endpoint.selections {
                    self.registry.attach(
                        &clipboard.label,
                        &endpoint.label,
                        Arc::clone(&handle),
                        *kind,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// An endpoint reported a selection change.
    pub fn on_notice(&mut self, notice: UpdateNotice) {
        let Some(clipboard) = self.registry.get_mut(notice.clipboard) else {
            tracing::debug!(clipboard = %notice.clipboard, "notice for unknown clipboard");
            return;
        };
        if let Some(job) = clipboard.request_update(notice) {
            self.spawn_capture(job);
        }
    }

    pub fn on_progress(&mut self, progress: Progress) {
        match progress {
            Progress::Captured { clipboard, result } => self.on_captured(clipboard, result),
            Progress::Delivered { clipboard, report } => {
                tracing::debug!(
                    %clipboard,
                    delivered = report.delivered.len(),
                    failed = report.failed.len(),
                    "delivery reported"
                );
                self.finish(clipboard);
            }
        }
    }

    fn on_captured(&mut self, id: ClipboardId, result: Result<Option<Snapshot>>) {
        let Some(clipboard) = self.registry.get_mut(id) else {
            return;
        };
        match result {
            Ok(Some(snapshot)) => match clipboard.commit(&mut self.store, snapshot) {
                Ok(fan_out) => {
                    self.spawn_deliver(fan_out);
                    return;
                }
                Err(e) => {
                    tracing::warn!(clipboard = clipboard.label(), error = %e, "update not persisted");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(clipboard = clipboard.label(), error = %e, "update discarded");
            }
        }
        self.finish(id);
    }

    /// End the clipboard's current update and start the next queued
    /// capture or activation.
    fn finish(&mut self, id: ClipboardId) {
        let next = self
            .registry
            .get_mut(id)
            .and_then(|clipboard| clipboard.finish_update());
        match next {
            Some(Work::Capture(job)) => self.spawn_capture(job),
            Some(Work::Deliver(fan_out)) => self.spawn_deliver(fan_out),
            None => {}
        }
    }

    pub fn spawn_capture(&self, job: UpdateJob) {
        let tx = self.progress.clone();
        tokio::spawn(async move {
            let clipboard = job.clipboard();
            let result = capture(job).await;
            let _ = tx.send(Progress::Captured { clipboard, result });
        });
    }

    pub fn spawn_deliver(&self, fan_out: FanOut) {
        let tx = self.progress.clone();
        tokio::spawn(async move {
            let clipboard = fan_out.clipboard();
            let report = fan_out.deliver().await;
            let _ = tx.send(Progress::Delivered { clipboard, report });
        });
    }
}
