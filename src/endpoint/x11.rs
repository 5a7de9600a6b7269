//! X11 endpoint: selection sync over a hidden window.
//!
//! Wraps `x11rb::rust_connection::RustConnection`:
//!
//! - owner changes arrive as XFixes `SelectionNotify` events; changes
//!   caused by our own window are suppressed,
//! - reads go through `ConvertSelection` (`TARGETS` first, then one
//!   conversion per mime type), including INCR incremental transfers,
//! - `adopt` takes selection ownership and answers `SelectionRequest`s
//!   from the entry held in memory.
//!
//! A dedicated thread polls the connection fd and handles every event.
//! Async callers wait on a oneshot that the thread completes.

use std::collections::{BTreeSet, HashMap};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use bytes::Bytes;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::oneshot;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ConnectionError;
use x11rb::protocol::Event;
use x11rb::protocol::xfixes::{ConnectionExt as _, SelectionEventMask};
use x11rb::protocol::xproto::{
    self, Atom, AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, PropMode, Property,
    SelectionNotifyEvent, SelectionRequestEvent, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME, NONE};

use super::{Endpoint, EndpointId, Notifier, SelectionKind, UpdateListener};
use crate::entry::Entry;
use crate::error::{Error, Result};

/// Targets that describe the selection rather than carry content.
const META_TARGETS: &[&str] = &[
    "TARGETS",
    "TIMESTAMP",
    "MULTIPLE",
    "SAVE_TARGETS",
    "DELETE",
    "INSERT_SELECTION",
    "INSERT_PROPERTY",
];

/// Longest property read, in 32-bit units.
const MAX_PROPERTY_UNITS: u32 = u32::MAX / 4;

fn x11<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::Transfer(format!("x11 {what}: {e}"))
}

fn intern(conn: &RustConnection, name: &str) -> Result<Atom> {
    Ok(conn
        .intern_atom(false, name.as_bytes())
        .map_err(x11("intern_atom"))?
        .reply()
        .map_err(x11("intern_atom reply"))?
        .atom)
}

/// Run a blocking X11 round trip off the async worker.
///
/// x11rb reads replies synchronously; they must not run on a runtime
/// worker.
async fn round_trip<S, T, F>(state: Arc<S>, f: F) -> Result<T>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(x11("round trip"))?
}

/// Pre-interned atoms.
struct Atoms {
    clipboard: Atom,
    primary: Atom,
    targets: Atom,
    incr: Atom,
    /// Properties on our window that conversions are delivered into,
    /// one per selection so regular and primary reads never collide.
    clipboard_property: Atom,
    primary_property: Atom,
}

impl Atoms {
    fn intern(conn: &RustConnection) -> Result<Self> {
        Ok(Self {
            clipboard: intern(conn, "CLIPBOARD")?,
            primary: AtomEnum::PRIMARY.into(),
            targets: intern(conn, "TARGETS")?,
            incr: intern(conn, "INCR")?,
            clipboard_property: intern(conn, "CLIPSYNC_CLIPBOARD")?,
            primary_property: intern(conn, "CLIPSYNC_PRIMARY")?,
        })
    }

    fn selection(&self, kind: SelectionKind) -> Atom {
        match kind {
            SelectionKind::Regular => self.clipboard,
            SelectionKind::Primary => self.primary,
        }
    }

    fn kind(&self, selection: Atom) -> Option<SelectionKind> {
        if selection == self.clipboard {
            Some(SelectionKind::Regular)
        } else if selection == self.primary {
            Some(SelectionKind::Primary)
        } else {
            None
        }
    }

    fn property(&self, selection: Atom) -> Atom {
        if selection == self.primary {
            self.primary_property
        } else {
            self.clipboard_property
        }
    }

    fn selection_for_property(&self, property: Atom) -> Option<Atom> {
        if property == self.clipboard_property {
            Some(self.clipboard)
        } else if property == self.primary_property {
            Some(self.primary)
        } else {
            None
        }
    }
}

/// An in-flight `ConvertSelection`, keyed by selection atom.
struct Pending {
    target: Atom,
    /// Accumulated chunks once the owner switched to INCR.
    incr: Option<Vec<u8>>,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// Content we serve while owning a selection.
struct OwnedTarget {
    mime: String,
    bytes: Bytes,
}

struct Shared {
    id: EndpointId,
    conn: RustConnection,
    window: Window,
    atoms: Atoms,
    notifier: Notifier,
    pending: Mutex<HashMap<Atom, Pending>>,
    owned: Mutex<HashMap<Atom, HashMap<Atom, OwnedTarget>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<Atom, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owned(&self) -> MutexGuard<'_, HashMap<Atom, HashMap<Atom, OwnedTarget>>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner(&self, selection: Atom) -> Result<Window> {
        Ok(self
            .conn
            .get_selection_owner(selection)
            .map_err(x11("get_selection_owner"))?
            .reply()
            .map_err(x11("get_selection_owner reply"))?
            .owner)
    }

    /// Read and delete a property on our window: `(type, value)`.
    fn take_property(&self, property: Atom) -> Result<(Atom, Vec<u8>)> {
        let reply = self
            .conn
            .get_property(
                true,
                self.window,
                property,
                AtomEnum::ANY,
                0,
                MAX_PROPERTY_UNITS,
            )
            .map_err(x11("get_property"))?
            .reply()
            .map_err(x11("get_property reply"))?;
        Ok((reply.type_, reply.value))
    }

    fn complete(&self, selection: Atom, result: Result<Bytes>) {
        if let Some(pending) = self.pending().remove(&selection) {
            // Receiver gone means the caller timed out.
            let _ = pending.reply.send(result);
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::XfixesSelectionNotify(ev) => {
                if ev.owner == self.window {
                    return;
                }
                if let Some(kind) = self.atoms.kind(ev.selection) {
                    tracing::trace!(endpoint = %self.id, selection = %kind, owner = ev.owner, "selection owner changed");
                    self.notifier.notify(self.id, kind);
                }
            }
            Event::SelectionNotify(ev) if ev.requestor == self.window => {
                self.on_selection_notify(ev);
            }
            Event::PropertyNotify(ev) if ev.window == self.window && ev.state == Property::NEW_VALUE => {
                self.on_incr_chunk(ev.atom);
            }
            Event::SelectionRequest(ev) => self.on_selection_request(ev),
            Event::SelectionClear(ev) => {
                self.owned().remove(&ev.selection);
            }
            _ => {}
        }
    }

    fn on_selection_notify(&self, ev: SelectionNotifyEvent) {
        let expected = self
            .pending()
            .get(&ev.selection)
            .is_some_and(|p| p.target == ev.target);
        if !expected {
            return;
        }
        if ev.property == NONE {
            self.complete(
                ev.selection,
                Err(Error::Transfer("selection owner refused conversion".into())),
            );
            return;
        }

        match self.take_property(ev.property) {
            Err(e) => self.complete(ev.selection, Err(e)),
            Ok((ty, _)) if ty == self.atoms.incr => {
                // Deleting the INCR property asked the owner to start
                // sending chunks; they arrive as PropertyNotify events.
                if let Some(pending) = self.pending().get_mut(&ev.selection) {
                    pending.incr = Some(Vec::new());
                }
            }
            Ok((_, value)) => self.complete(ev.selection, Ok(Bytes::from(value))),
        }
    }

    fn on_incr_chunk(&self, property: Atom) {
        let Some(selection) = self.atoms.selection_for_property(property) else {
            return;
        };
        let receiving = self
            .pending()
            .get(&selection)
            .is_some_and(|p| p.incr.is_some());
        if !receiving {
            return;
        }

        match self.take_property(property) {
            Err(e) => self.complete(selection, Err(e)),
            Ok((_, chunk)) if chunk.is_empty() => {
                let done = self.pending().remove(&selection);
                if let Some(pending) = done {
                    let bytes = Bytes::from(pending.incr.unwrap_or_default());
                    let _ = pending.reply.send(Ok(bytes));
                }
            }
            Ok((_, chunk)) => {
                if let Some(buf) = self
                    .pending()
                    .get_mut(&selection)
                    .and_then(|p| p.incr.as_mut())
                {
                    buf.extend_from_slice(&chunk);
                }
            }
        }
    }

    fn on_selection_request(&self, ev: SelectionRequestEvent) {
        // Obsolete clients pass no property; use the target name.
        let property = if ev.property == NONE {
            ev.target
        } else {
            ev.property
        };
        let served = match self.serve(&ev, property) {
            Ok(served) => served,
            Err(e) => {
                tracing::warn!(endpoint = %self.id, error = %e, "failed to answer selection request");
                false
            }
        };

        let reply = SelectionNotifyEvent {
            response_type: xproto::SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: ev.time,
            requestor: ev.requestor,
            selection: ev.selection,
            target: ev.target,
            property: if served { property } else { NONE },
        };
        if let Err(e) = self
            .conn
            .send_event(false, ev.requestor, EventMask::NO_EVENT, reply)
        {
            tracing::warn!(endpoint = %self.id, error = %e, "failed to send selection notify");
        }
        if let Err(e) = self.conn.flush() {
            tracing::debug!(error = %e, "flush after selection notify failed");
        }
    }

    fn serve(&self, ev: &SelectionRequestEvent, property: Atom) -> std::result::Result<bool, ConnectionError> {
        let owned = self.owned();
        let Some(content) = owned.get(&ev.selection) else {
            return Ok(false);
        };

        if ev.target == self.atoms.targets {
            let mut targets = vec![self.atoms.targets];
            targets.extend(content.keys().copied());
            self.conn.change_property32(
                PropMode::REPLACE,
                ev.requestor,
                property,
                AtomEnum::ATOM,
                &targets,
            )?;
            return Ok(true);
        }

        let Some(target) = content.get(&ev.target) else {
            return Ok(false);
        };
        // Serving INCR is not supported; refuse what does not fit one request.
        if target.bytes.len() + 64 > self.conn.maximum_request_bytes() {
            tracing::debug!(
                endpoint = %self.id,
                mime = %target.mime,
                size = target.bytes.len(),
                "refusing oversized selection request"
            );
            return Ok(false);
        }
        self.conn.change_property8(
            PropMode::REPLACE,
            ev.requestor,
            property,
            ev.target,
            &target.bytes,
        )?;
        Ok(true)
    }
}

pub struct X11Endpoint {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl X11Endpoint {
    /// Connect to `display` (or `$DISPLAY`), create the hidden window
    /// and start the event thread.
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(display).map_err(x11("connect"))?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_else(|| Error::Transfer(format!("x11: no screen {screen_num}")))?
            .root;

        let window = conn.generate_id().map_err(x11("generate_id"))?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )
        .map_err(x11("create_window"))?;

        let atoms = Atoms::intern(&conn)?;

        conn.xfixes_query_version(5, 0)
            .map_err(x11("xfixes_query_version"))?
            .reply()
            .map_err(x11("xfixes_query_version reply"))?;
        for selection in [atoms.clipboard, atoms.primary] {
            conn.xfixes_select_selection_input(
                window,
                selection,
                SelectionEventMask::SET_SELECTION_OWNER
                    | SelectionEventMask::SELECTION_WINDOW_DESTROY
                    | SelectionEventMask::SELECTION_CLIENT_CLOSE,
            )
            .map_err(x11("xfixes_select_selection_input"))?;
        }
        conn.flush().map_err(x11("flush"))?;

        let shared = Arc::new(Shared {
            id: EndpointId::new(),
            conn,
            window,
            atoms,
            notifier: Notifier::default(),
            pending: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashMap::new()),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_event_thread(Arc::clone(&shared), Arc::clone(&stop))
            .map_err(x11("spawn event thread"))?;

        let shown = display.unwrap_or("$DISPLAY");
        tracing::info!(
            endpoint = %shared.id,
            display = %shown,
            window,
            "connected to X11 display"
        );

        Ok(Self {
            shared,
            stop,
            thread: Some(thread),
        })
    }

    /// Ask the owner of `selection` to convert to `target` and wait for
    /// the bytes.
    async fn convert(&self, selection: Atom, target: Atom) -> Result<Bytes> {
        let shared = &self.shared;
        let (tx, rx) = oneshot::channel();
        // A newer request replaces one the caller already gave up on.
        shared.pending().insert(
            selection,
            Pending {
                target,
                incr: None,
                reply: tx,
            },
        );

        shared
            .conn
            .convert_selection(
                shared.window,
                selection,
                target,
                shared.atoms.property(selection),
                CURRENT_TIME,
            )
            .map_err(x11("convert_selection"))?;
        shared.conn.flush().map_err(x11("flush"))?;

        rx.await
            .map_err(|_| Error::Transfer("x11 event thread stopped".into()))?
    }
}

impl Drop for X11Endpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Err(e) = self.shared.conn.destroy_window(self.shared.window) {
            tracing::debug!(error = %e, "destroy_window failed");
        }
        let _ = self.shared.conn.flush();
    }
}

#[async_trait]
impl Endpoint for X11Endpoint {
    fn id(&self) -> EndpointId {
        self.shared.id
    }

    fn transport(&self) -> &'static str {
        "x11"
    }

    fn subscribe(&self, kind: SelectionKind, listener: Option<UpdateListener>) {
        self.shared.notifier.subscribe(kind, listener);
    }

    async fn mime_types(&self, kind: SelectionKind) -> Result<Option<BTreeSet<String>>> {
        let shared = &self.shared;
        let selection = shared.atoms.selection(kind);
        let owner = round_trip(Arc::clone(shared), move |s| s.owner(selection)).await?;
        if owner == NONE {
            return Ok(None);
        }
        if owner == shared.window {
            return Ok(shared
                .owned()
                .get(&selection)
                .map(|content| content.values().map(|t| t.mime.clone()).collect()));
        }

        let raw = self.convert(selection, shared.atoms.targets).await?;
        let atoms: Vec<Atom> = raw
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .filter(|&atom| atom != NONE)
            .collect();

        let mimes = round_trip(Arc::clone(shared), move |s| {
            // Pipeline the name lookups: send every request, then collect.
            let mut cookies = Vec::with_capacity(atoms.len());
            for atom in atoms {
                cookies.push(s.conn.get_atom_name(atom).map_err(x11("get_atom_name"))?);
            }
            let mut mimes = BTreeSet::new();
            for cookie in cookies {
                let name = cookie.reply().map_err(x11("get_atom_name reply"))?.name;
                let name = String::from_utf8_lossy(&name).into_owned();
                if !META_TARGETS.contains(&name.as_str()) {
                    mimes.insert(name);
                }
            }
            Ok(mimes)
        })
        .await?;
        Ok(Some(mimes))
    }

    async fn data(&self, mime_type: &str, kind: SelectionKind) -> Result<Bytes> {
        let shared = &self.shared;
        let selection = shared.atoms.selection(kind);
        let name = mime_type.to_string();
        let (target, owner) = round_trip(Arc::clone(shared), move |s| {
            Ok((intern(&s.conn, &name)?, s.owner(selection)?))
        })
        .await?;

        if owner == shared.window {
            return shared
                .owned()
                .get(&selection)
                .and_then(|content| content.get(&target))
                .map(|t| t.bytes.clone())
                .ok_or_else(|| Error::Transfer(format!("{mime_type} is not offered")));
        }
        self.convert(selection, target).await
    }

    async fn adopt(&self, entry: &Entry, kind: SelectionKind) -> Result<()> {
        let shared = &self.shared;
        let selection = shared.atoms.selection(kind);

        if entry.is_cleared() {
            shared.owned().remove(&selection);
            shared
                .conn
                .set_selection_owner(NONE, selection, CURRENT_TIME)
                .map_err(x11("set_selection_owner"))?;
            shared.conn.flush().map_err(x11("flush"))?;
            return Ok(());
        }

        let mappings: Vec<(String, Bytes)> = entry
            .mappings()
            .map(|(mime, data)| (mime.to_string(), data.bytes().clone()))
            .collect();
        let owned = round_trip(Arc::clone(shared), move |s| {
            let mut content = HashMap::new();
            for (mime, bytes) in mappings {
                content.insert(intern(&s.conn, &mime)?, OwnedTarget { mime, bytes });
            }
            s.owned().insert(selection, content);

            s.conn
                .set_selection_owner(s.window, selection, CURRENT_TIME)
                .map_err(x11("set_selection_owner"))?;
            if s.owner(selection)? == s.window {
                return Ok(true);
            }
            s.owned().remove(&selection);
            Ok(false)
        })
        .await?;
        if !owned {
            return Err(Error::Transfer(format!(
                "x11: could not take ownership of the {kind} selection"
            )));
        }

        tracing::debug!(endpoint = %shared.id, selection = %kind, entry = entry.id(), "owning selection");
        Ok(())
    }
}

/// Spawn the thread that polls the X11 connection and handles events.
///
/// Uses `nix::poll()` on the connection fd with a 100ms timeout, then
/// drains every queued event. Replies read by other threads can queue
/// events without waking the fd, so the queue is drained after a
/// timeout as well. Checks `stop` each iteration.
fn spawn_event_thread(shared: Arc<Shared>, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("x11-selection".into())
        .spawn(move || {
            let raw_fd = shared.conn.stream().as_raw_fd();

            while !stop.load(Ordering::Relaxed) {
                // SAFETY: raw_fd is the X11 connection fd, valid while conn is alive.
                let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];

                match poll(&mut fds, PollTimeout::from(100u16)) {
                    Ok(_) => {}
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => {
                        tracing::error!(endpoint = %shared.id, error = %e, "poll error on X11 fd");
                        return;
                    }
                }

                loop {
                    match shared.conn.poll_for_event() {
                        Ok(Some(event)) => shared.handle_event(event),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(endpoint = %shared.id, error = %e, "X11 connection error");
                            // Fail every waiter instead of leaving it to time out.
                            let waiters: Vec<_> = shared.pending().drain().collect();
                            for (_, pending) in waiters {
                                let _ = pending
                                    .reply
                                    .send(Err(Error::Transfer(format!("x11 connection: {e}"))));
                            }
                            return;
                        }
                    }
                }
            }
        })
}
