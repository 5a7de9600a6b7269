//! Message dispatch and request handling.
//!
//! Pure logic: no socket I/O. Each handler takes the daemon state and
//! returns a response, plus a [`FanOut`] when the request pushes an
//! entry to endpoints right away (`activate_entry` on an idle
//! clipboard). The daemon loop spawns the delivery.

use crate::clipboard::{Clipboard, FanOut};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::ipc::protocol::{
    ClipboardDescriptor, EndpointDescriptor, EntryDescriptor, Message, PROTOCOL_VERSION, Response,
    Status,
};

use super::state::DaemonState;

/// Dispatch a request message to the appropriate handler.
///
/// Errors become `response` messages carrying [`Error::reason`].
/// Server-originated variants get `unknown_type`.
pub fn handle_message(state: &mut DaemonState, request: Message) -> (Message, Option<FanOut>) {
    let id = request.id();
    let result = match request {
        Message::Hello { id, version } => return (handle_hello(id, version), None),
        Message::ListClipboards { id } => Ok(handle_list_clipboards(state, id)),
        Message::AddClipboard {
            id,
            label,
            max_entries,
        } => handle_add_clipboard(state, id, &label, max_entries),
        Message::RenameClipboard {
            id,
            clipboard,
            label,
        } => state
            .registry
            .rename(&mut state.store, &clipboard, &label)
            .map(|()| Response::ok(id)),
        Message::ListEndpoints { id, clipboard } => handle_list_endpoints(state, id, &clipboard),
        Message::GetEntry {
            id,
            clipboard,
            index,
            mime_type,
        } => handle_get_entry(state, id, &clipboard, index, mime_type.as_deref()),
        Message::GetEntryById {
            id,
            entry_id,
            mime_type,
        } => handle_get_entry_by_id(state, id, &entry_id, mime_type.as_deref()),
        Message::ListEntries {
            id,
            clipboard,
            limit,
        } => handle_list_entries(state, id, &clipboard, limit),
        Message::SetStarred {
            id,
            entry_id,
            starred,
        } => with_owner(state, &entry_id, |clipboard, store| {
            clipboard.set_starred(store, &entry_id, starred)
        })
        .map(|()| Response::ok(id)),
        Message::RemoveEntry { id, entry_id } => with_owner(state, &entry_id, |clipboard, store| {
            clipboard.remove_entry(store, &entry_id)
        })
        .map(|()| Response::ok(id)),
        Message::ClearHistory { id, clipboard } => state
            .registry
            .by_label_mut(&clipboard)
            .and_then(|c| c.clear(&mut state.store))
            .map(|removed| Response {
                removed: Some(removed as u32),
                ..Response::ok(id)
            }),
        Message::ActivateEntry { id, entry_id } => {
            match with_owner(state, &entry_id, |clipboard, store| {
                clipboard.activate(store, &entry_id)
            }) {
                Ok(fan_out) => return (Response::ok(id).into(), fan_out),
                Err(e) => Err(e),
            }
        }
        // Server-originated messages should never be sent by clients.
        Message::HelloAck { id, .. } => return (Response::error(id, "unknown_type").into(), None),
        Message::Response(response) => {
            return (Response::error(response.id, "unknown_type").into(), None);
        }
    };

    match result {
        Ok(response) => (response.into(), None),
        Err(e) => {
            tracing::debug!(id, reason = e.reason(), error = %e, "request failed");
            (Response::error(id, e.reason()).into(), None)
        }
    }
}

// -- Individual handlers --

fn handle_hello(id: u32, version: u32) -> Message {
    // hello and its ack always carry id 0.
    if id != 0 {
        return hello_ack_error("invalid_hello_id");
    }
    if version != PROTOCOL_VERSION {
        return hello_ack_error("version_mismatch");
    }
    Message::HelloAck {
        id: 0,
        status: Status::Ok,
        error: None,
    }
}

fn hello_ack_error(reason: &str) -> Message {
    Message::HelloAck {
        id: 0,
        status: Status::Error,
        error: Some(reason.into()),
    }
}

fn handle_list_clipboards(state: &DaemonState, id: u32) -> Response {
    let clipboards = state
        .registry
        .iter()
        .map(|c| ClipboardDescriptor {
            label: c.label().to_string(),
            max_entries: c.settings().max_entries as u32,
            entries: c.len() as u32,
            endpoints: c.endpoints().len() as u32,
        })
        .collect();
    Response {
        clipboards: Some(clipboards),
        ..Response::ok(id)
    }
}

fn handle_add_clipboard(
    state: &mut DaemonState,
    id: u32,
    label: &str,
    max_entries: Option<u32>,
) -> Result<Response> {
    let max_entries = max_entries.map_or(crate::clipboard::DEFAULT_MAX_ENTRIES, |n| n as usize);
    let settings = state.config().runtime_settings(max_entries);
    state.registry.add(&mut state.store, label, settings)?;
    Ok(Response::ok(id))
}

fn handle_list_endpoints(state: &DaemonState, id: u32, clipboard: &str) -> Result<Response> {
    let endpoints = state
        .registry
        .by_label(clipboard)?
        .endpoints()
        .into_iter()
        .map(|info| EndpointDescriptor {
            label: info.label,
            transport: info.transport.to_string(),
            selection: info.kind.to_string(),
        })
        .collect();
    Ok(Response {
        endpoints: Some(endpoints),
        ..Response::ok(id)
    })
}

fn handle_get_entry(
    state: &DaemonState,
    id: u32,
    clipboard: &str,
    index: u32,
    mime_type: Option<&str>,
) -> Result<Response> {
    let clipboard = state.registry.by_label(clipboard)?;
    let entry = clipboard
        .get_entry(&state.store, index as usize)?
        .ok_or_else(|| Error::NotFound(format!("entry {index} in {}", clipboard.label())))?;
    entry_response(clipboard, &entry, id, mime_type)
}

fn handle_get_entry_by_id(
    state: &DaemonState,
    id: u32,
    entry_id: &str,
    mime_type: Option<&str>,
) -> Result<Response> {
    let owner = state.registry.find_entry(entry_id)?;
    let clipboard = state
        .registry
        .get(owner)
        .ok_or_else(|| Error::NotFound(format!("entry {entry_id}")))?;
    let entry = clipboard.get_entry_by_id(&state.store, entry_id)?;
    entry_response(clipboard, &entry, id, mime_type)
}

fn handle_list_entries(
    state: &DaemonState,
    id: u32,
    clipboard: &str,
    limit: Option<u32>,
) -> Result<Response> {
    let clipboard = state.registry.by_label(clipboard)?;
    let limit = limit.map_or(usize::MAX, |n| n as usize);
    let entries = clipboard
        .entry_ids()
        .take(limit)
        .map(|entry_id| {
            let entry = state.store.deserialize_entry(entry_id)?;
            Ok(describe(clipboard, &entry))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Response {
        entries: Some(entries),
        ..Response::ok(id)
    })
}

/// Run `f` on the clipboard whose history holds `entry_id`.
fn with_owner<T>(
    state: &mut DaemonState,
    entry_id: &str,
    f: impl FnOnce(&mut Clipboard, &mut crate::store::Store) -> Result<T>,
) -> Result<T> {
    let owner = state.registry.find_entry(entry_id)?;
    let clipboard = state
        .registry
        .get_mut(owner)
        .ok_or_else(|| Error::NotFound(format!("entry {entry_id}")))?;
    f(clipboard, &mut state.store)
}

fn describe(clipboard: &Clipboard, entry: &Entry) -> EntryDescriptor {
    EntryDescriptor {
        entry_id: entry.id().to_string(),
        clipboard: entry.clipboard().to_string(),
        index: clipboard.index_of(entry.id()).unwrap_or_default(),
        creation_time: entry.creation_time(),
        last_used_time: entry.last_used_time(),
        starred: entry.is_starred(),
        mime_types: entry.mime_types().map(str::to_string).collect(),
        byte_length: entry.byte_size() as u64,
    }
}

fn entry_response(
    clipboard: &Clipboard,
    entry: &Entry,
    id: u32,
    mime_type: Option<&str>,
) -> Result<Response> {
    let content = match mime_type {
        Some(mime) => Some(
            entry
                .data(mime)
                .ok_or_else(|| Error::NotFound(format!("mime type {mime} in entry {}", entry.id())))?
                .to_vec(),
        ),
        None => None,
    };
    Ok(Response {
        entry: Some(describe(clipboard, entry)),
        content,
        ..Response::ok(id)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::endpoint::{Endpoint, MemoryEndpoint, SelectionKind};
    use crate::store::Store;

    const REGULAR: SelectionKind = SelectionKind::Regular;

    fn fresh() -> DaemonState {
        let (updates_tx, _) = mpsc::unbounded_channel();
        let (progress_tx, _) = mpsc::unbounded_channel();
        DaemonState::new(
            Config::default(),
            Store::in_memory().unwrap(),
            updates_tx,
            progress_tx,
        )
    }

    fn respond(state: &mut DaemonState, msg: Message) -> Response {
        match handle_message(state, msg).0 {
            Message::Response(response) => response,
            other => panic!("expected Response, got {other:?}"),
        }
    }

    fn assert_error(response: &Response, reason: &str) {
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error.as_deref(), Some(reason));
    }

    fn add(state: &mut DaemonState, label: &str) {
        let r = respond(
            state,
            Message::AddClipboard {
                id: 1,
                label: label.into(),
                max_entries: None,
            },
        );
        assert_eq!(r.status, Status::Ok);
    }

    /// Attach a memory endpoint to `main` and record `texts` in order.
    async fn populate(state: &mut DaemonState, texts: &[&str]) -> (Arc<MemoryEndpoint>, Vec<String>) {
        add(state, "main");
        let ep = Arc::new(MemoryEndpoint::new());
        state.registry.attach("main", "laptop", ep.clone(), REGULAR).unwrap();
        let id = state.registry.by_label("main").unwrap().id();
        let mut ids = Vec::new();
        for text in texts {
            ep.set_text(REGULAR, text);
            let entry = state
                .registry
                .get_mut(id)
                .unwrap()
                .on_update(&mut state.store, ep.id(), REGULAR)
                .await
                .unwrap()
                .unwrap();
            ids.push(entry);
        }
        (ep, ids)
    }

    // -- Handshake --

    #[test]
    fn hello_valid() {
        let mut state = fresh();
        let (resp, _) = handle_message(
            &mut state,
            Message::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
            },
        );
        assert_eq!(
            resp,
            Message::HelloAck {
                id: 0,
                status: Status::Ok,
                error: None,
            }
        );
    }

    #[test]
    fn hello_version_mismatch() {
        let mut state = fresh();
        let (resp, _) = handle_message(&mut state, Message::Hello { id: 0, version: 99 });
        assert!(matches!(
            resp,
            Message::HelloAck { status: Status::Error, error: Some(ref e), .. } if e == "version_mismatch"
        ));
    }

    #[test]
    fn hello_nonzero_id_rejected() {
        let mut state = fresh();
        let (resp, _) = handle_message(
            &mut state,
            Message::Hello {
                id: 3,
                version: PROTOCOL_VERSION,
            },
        );
        assert!(matches!(
            resp,
            Message::HelloAck { id: 0, status: Status::Error, error: Some(ref e) } if e == "invalid_hello_id"
        ));
    }

    #[test]
    fn server_originated_messages_are_unknown_type() {
        let mut state = fresh();
        let r = respond(&mut state, Response::ok(12).into());
        assert_eq!(r.id, 12);
        assert_error(&r, "unknown_type");

        let r = respond(
            &mut state,
            Message::HelloAck {
                id: 4,
                status: Status::Ok,
                error: None,
            },
        );
        assert_error(&r, "unknown_type");
    }

    // -- Clipboards --

    #[test]
    fn add_and_list_clipboards() {
        let mut state = fresh();
        add(&mut state, "main");
        let r = respond(
            &mut state,
            Message::AddClipboard {
                id: 2,
                label: "work".into(),
                max_entries: Some(5),
            },
        );
        assert_eq!(r.status, Status::Ok);

        let r = respond(&mut state, Message::ListClipboards { id: 3 });
        let clipboards = r.clipboards.unwrap();
        assert_eq!(clipboards.len(), 2);
        let work = clipboards.iter().find(|c| c.label == "work").unwrap();
        assert_eq!(work.max_entries, 5);
        assert_eq!(work.entries, 0);
    }

    #[test]
    fn add_duplicate_is_conflict_and_zero_bound_is_validation() {
        let mut state = fresh();
        add(&mut state, "main");
        let r = respond(
            &mut state,
            Message::AddClipboard {
                id: 2,
                label: "main".into(),
                max_entries: None,
            },
        );
        assert_error(&r, "conflict");
        assert_eq!(r.id, 2);

        let r = respond(
            &mut state,
            Message::AddClipboard {
                id: 3,
                label: "tiny".into(),
                max_entries: Some(0),
            },
        );
        assert_error(&r, "validation");
    }

    #[test]
    fn rename_clipboard() {
        let mut state = fresh();
        add(&mut state, "main");
        let r = respond(
            &mut state,
            Message::RenameClipboard {
                id: 2,
                clipboard: "main".into(),
                label: "work".into(),
            },
        );
        assert_eq!(r.status, Status::Ok);
        assert!(state.registry.by_label("work").is_ok());

        let r = respond(
            &mut state,
            Message::RenameClipboard {
                id: 3,
                clipboard: "main".into(),
                label: "again".into(),
            },
        );
        assert_error(&r, "not_found");
    }

    #[test]
    fn list_endpoints() {
        let mut state = fresh();
        add(&mut state, "main");
        state
            .registry
            .attach("main", "laptop", Arc::new(MemoryEndpoint::new()), REGULAR)
            .unwrap();
        let r = respond(
            &mut state,
            Message::ListEndpoints {
                id: 2,
                clipboard: "main".into(),
            },
        );
        assert_eq!(
            r.endpoints.unwrap(),
            vec![EndpointDescriptor {
                label: "laptop".into(),
                transport: "memory".into(),
                selection: "regular".into(),
            }]
        );

        let r = respond(
            &mut state,
            Message::ListEndpoints {
                id: 3,
                clipboard: "nope".into(),
            },
        );
        assert_error(&r, "not_found");
    }

    // -- Entries --

    #[tokio::test]
    async fn get_entry_by_index_with_content() {
        let mut state = fresh();
        let (_ep, ids) = populate(&mut state, &["first", "second"]).await;

        let r = respond(
            &mut state,
            Message::GetEntry {
                id: 5,
                clipboard: "main".into(),
                index: 0,
                mime_type: Some("text/plain".into()),
            },
        );
        assert_eq!(r.status, Status::Ok);
        let entry = r.entry.unwrap();
        assert_eq!(entry.entry_id, ids[1]);
        assert_eq!(entry.mime_types, vec!["text/plain".to_string()]);
        assert_eq!(entry.byte_length, 6);
        assert_eq!(r.content.unwrap(), b"second");

        let r = respond(
            &mut state,
            Message::GetEntry {
                id: 6,
                clipboard: "main".into(),
                index: 1,
                mime_type: None,
            },
        );
        assert_eq!(r.entry.unwrap().entry_id, ids[0]);
        assert!(r.content.is_none());

        let r = respond(
            &mut state,
            Message::GetEntry {
                id: 7,
                clipboard: "main".into(),
                index: 2,
                mime_type: None,
            },
        );
        assert_error(&r, "not_found");
    }

    #[tokio::test]
    async fn get_entry_by_id_and_missing_mime() {
        let mut state = fresh();
        let (_ep, ids) = populate(&mut state, &["only"]).await;

        let r = respond(
            &mut state,
            Message::GetEntryById {
                id: 2,
                entry_id: ids[0].clone(),
                mime_type: Some("text/plain".into()),
            },
        );
        assert_eq!(r.content.unwrap(), b"only");

        let r = respond(
            &mut state,
            Message::GetEntryById {
                id: 3,
                entry_id: ids[0].clone(),
                mime_type: Some("image/png".into()),
            },
        );
        assert_error(&r, "not_found");

        let r = respond(
            &mut state,
            Message::GetEntryById {
                id: 4,
                entry_id: "missing".into(),
                mime_type: None,
            },
        );
        assert_error(&r, "not_found");
    }

    #[tokio::test]
    async fn list_entries_newest_first_with_limit() {
        let mut state = fresh();
        let (_ep, ids) = populate(&mut state, &["a", "b", "c"]).await;

        let r = respond(
            &mut state,
            Message::ListEntries {
                id: 2,
                clipboard: "main".into(),
                limit: Some(2),
            },
        );
        let entries = r.entries.unwrap();
        let listed: Vec<_> = entries.iter().map(|e| e.entry_id.as_str()).collect();
        assert_eq!(listed, vec![ids[2].as_str(), ids[1].as_str()]);
        assert!(entries[0].index > entries[1].index);
    }

    #[tokio::test]
    async fn star_remove_and_clear() {
        let mut state = fresh();
        let (_ep, ids) = populate(&mut state, &["a", "b", "c"]).await;

        let r = respond(
            &mut state,
            Message::SetStarred {
                id: 2,
                entry_id: ids[0].clone(),
                starred: true,
            },
        );
        assert_eq!(r.status, Status::Ok);

        let r = respond(
            &mut state,
            Message::RemoveEntry {
                id: 3,
                entry_id: ids[1].clone(),
            },
        );
        assert_eq!(r.status, Status::Ok);

        let r = respond(
            &mut state,
            Message::ClearHistory {
                id: 4,
                clipboard: "main".into(),
            },
        );
        assert_eq!(r.removed, Some(1));

        let clipboard = state.registry.by_label("main").unwrap();
        assert_eq!(clipboard.entry_ids().collect::<Vec<_>>(), vec![ids[0].as_str()]);

        let r = respond(
            &mut state,
            Message::RemoveEntry {
                id: 5,
                entry_id: ids[1].clone(),
            },
        );
        assert_error(&r, "not_found");
    }

    #[tokio::test]
    async fn activate_returns_fan_out_to_every_endpoint() {
        let mut state = fresh();
        let (ep, ids) = populate(&mut state, &["old", "new"]).await;

        let (resp, fan_out) = handle_message(
            &mut state,
            Message::ActivateEntry {
                id: 2,
                entry_id: ids[0].clone(),
            },
        );
        assert!(matches!(resp, Message::Response(Response { status: Status::Ok, .. })));
        let fan_out = fan_out.unwrap();
        assert_eq!(fan_out.target_labels().collect::<Vec<_>>(), vec!["laptop"]);
        fan_out.deliver().await;
        assert_eq!(ep.selection(REGULAR).unwrap()["text/plain"].as_ref(), b"old");

        let (resp, fan_out) = handle_message(
            &mut state,
            Message::ActivateEntry {
                id: 3,
                entry_id: "missing".into(),
            },
        );
        assert!(fan_out.is_none());
        assert!(matches!(resp, Message::Response(Response { status: Status::Error, .. })));
    }
}
