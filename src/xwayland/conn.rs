// SPDX-License-Identifier: GPL-3.0-only

//! The X11 side of the bridge.
//!
//! Everything the selection and drag-and-drop code does on the X server goes
//! through [`XConnection`]. Property reads never block the caller: a request
//! is tagged with a [`RequestId`] and its reply comes back later as an
//! [`XEvent::PropertyReply`].

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use smithay::utils::{Logical, Point, Size};
use tracing::{debug, warn};
use x11rb::{
    connection::{Connection, RequestConnection, SequenceNumber},
    cookie::Cookie,
    errors::{ConnectionError, ReplyError, ReplyOrIdError},
    protocol::{
        xfixes::{self, ConnectionExt as _, SelectionEventMask},
        xproto::{
            Atom, AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ConfigureWindowAux,
            ConnectionExt as _, CreateWindowAux, EventMask, GetAtomNameReply, GetPropertyReply,
            InternAtomReply, PropMode, PropertyNotifyEvent, SelectionNotifyEvent,
            SelectionRequestEvent, StackMode, Timestamp, Window, WindowClass,
        },
        Event,
    },
    wrapper::ConnectionExt as _,
    x11_utils::TryParse,
    COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, NONE,
};

use super::atoms::Atoms;

#[derive(Debug, thiserror::Error)]
pub enum XwlError {
    #[error("X11 connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("X11 request failed: {0}")]
    Reply(#[from] ReplyError),
    #[error("X11 request failed: {0}")]
    ReplyOrId(#[from] ReplyOrIdError),
    #[error("Transfer pipe error: {0}")]
    Io(#[from] rustix::io::Errno),
    #[error("Screen {0} does not exist")]
    NoScreen(usize),
    #[error("Atom {0} has no valid name")]
    InvalidAtomName(Atom),
}

static NEXT_REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

/// Tags a property read, so its reply can be routed back to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(usize);

impl RequestId {
    pub fn next() -> RequestId {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRequest {
    pub id: RequestId,
    pub window: Window,
    pub property: Atom,
    /// `AnyPropertyType` if 0
    pub type_: Atom,
    pub delete: bool,
    /// Length in 32 bit units
    pub long_length: u32,
}

/// X11 input of the bridge.
#[derive(Debug, Clone)]
pub enum XEvent {
    XfixesSelectionNotify(xfixes::SelectionNotifyEvent),
    SelectionNotify(SelectionNotifyEvent),
    SelectionRequest(SelectionRequestEvent),
    PropertyNotify(PropertyNotifyEvent),
    ClientMessage(ClientMessageEvent),
    /// Answer to [`XConnection::get_property`], `None` if the request failed.
    PropertyReply {
        id: RequestId,
        reply: Option<GetPropertyReply>,
    },
}

/// X11 requests used by the bridge.
pub trait XConnection {
    fn root(&self) -> Window;
    fn create_window(
        &self,
        parent: Window,
        loc: Point<i32, Logical>,
        size: Size<i32, Logical>,
        class: WindowClass,
        event_mask: EventMask,
    ) -> Result<Window, XwlError>;
    fn destroy_window(&self, window: Window) -> Result<(), XwlError>;
    fn map_window(&self, window: Window) -> Result<(), XwlError>;
    fn unmap_window(&self, window: Window) -> Result<(), XwlError>;
    fn raise_window(&self, window: Window) -> Result<(), XwlError>;
    fn select_window_events(&self, window: Window, mask: EventMask) -> Result<(), XwlError>;
    /// Subscribes `window` to XFixes ownership notifications of `selection`.
    fn select_selection_events(&self, window: Window, selection: Atom) -> Result<(), XwlError>;
    fn set_selection_owner(
        &self,
        owner: Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<(), XwlError>;
    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), XwlError>;
    fn change_property8(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), XwlError>;
    fn change_property32(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), XwlError>;
    fn delete_property(&self, window: Window, property: Atom) -> Result<(), XwlError>;
    /// Issues a property read. The reply is delivered as [`XEvent::PropertyReply`].
    fn get_property(&self, request: PropertyRequest) -> Result<(), XwlError>;
    /// Next reply that is ready to be dispatched, if any.
    fn poll_reply(&self) -> Option<XEvent>;
    fn send_client_message(
        &self,
        destination: Window,
        event: ClientMessageEvent,
    ) -> Result<(), XwlError>;
    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), XwlError>;
    /// Starts looking up atoms that will be needed soon, so a later
    /// [`XConnection::intern_atom`] finds them without a round trip.
    fn prefetch_atoms(&self, _names: &[String]) -> Result<(), XwlError> {
        Ok(())
    }
    fn intern_atom(&self, name: &str) -> Result<Atom, XwlError>;
    fn atom_name(&self, atom: Atom) -> Result<String, XwlError>;
    fn flush(&self) -> Result<(), XwlError>;
}

/// Tracks which replies the connection has already read from the socket.
///
/// The server answers requests in order, so once an event carrying a later
/// sequence number was read, every reply before it is buffered and
/// collecting it will not wait.
#[derive(Debug, Default, Clone, Copy)]
struct SequenceTracker {
    seen: Option<SequenceNumber>,
}

impl SequenceTracker {
    fn saw_event(&mut self, sequence: SequenceNumber) {
        self.seen = Some(self.seen.map_or(sequence, |seen| seen.max(sequence)));
    }

    fn arrived(&self, sequence: SequenceNumber) -> bool {
        self.seen.is_some_and(|seen| seen > sequence)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingProperty {
    id: RequestId,
    window: Window,
    sequence: SequenceNumber,
}

/// A property reply held back until the names of its atoms are known.
#[derive(Debug)]
struct PendingNames {
    id: RequestId,
    reply: Option<GetPropertyReply>,
    atoms: Vec<Atom>,
}

/// [`XConnection`] on top of an x11rb connection to Xwayland.
///
/// Requests with replies only remember their sequence number. Replies are
/// collected in [`XConnection::poll_reply`] once [`X11rbConnection::poll_event`]
/// read an event past them. Each such request is followed by an empty
/// property append on a private window, so an event always follows.
#[derive(Debug)]
pub struct X11rbConnection<C: Connection> {
    conn: Arc<C>,
    root: Window,
    sync_window: Window,
    sync_atom: Atom,
    tracker: Cell<SequenceTracker>,
    properties: RefCell<VecDeque<PendingProperty>>,
    named: RefCell<VecDeque<PendingNames>>,
    name_requests: RefCell<HashMap<Atom, SequenceNumber>>,
    intern_requests: RefCell<HashMap<String, SequenceNumber>>,
    atom_names: RefCell<HashMap<Atom, String>>,
    atoms_by_name: RefCell<HashMap<String, Atom>>,
}

impl<C: Connection> X11rbConnection<C> {
    pub fn new(conn: Arc<C>, screen: usize) -> Result<Self, XwlError> {
        let root = conn
            .setup()
            .roots
            .get(screen)
            .map(|screen| screen.root)
            .ok_or(XwlError::NoScreen(screen))?;
        // selection ownership tracking needs XFixes
        conn.xfixes_query_version(5, 0)?.reply()?;

        let sync_atom = conn.intern_atom(false, b"_XWL_BRIDGE_SYNC")?.reply()?.atom;
        let sync_window = conn.generate_id()?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            sync_window,
            root,
            -1,
            -1,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        conn.flush()?;

        Ok(X11rbConnection {
            conn,
            root,
            sync_window,
            sync_atom,
            tracker: Cell::new(SequenceTracker::default()),
            properties: RefCell::new(VecDeque::new()),
            named: RefCell::new(VecDeque::new()),
            name_requests: RefCell::new(HashMap::new()),
            intern_requests: RefCell::new(HashMap::new()),
            atom_names: RefCell::new(HashMap::new()),
            atoms_by_name: RefCell::new(HashMap::new()),
        })
    }

    pub fn atoms(&self) -> Result<Atoms, XwlError> {
        Ok(Atoms::new(&*self.conn)?.reply()?)
    }

    /// Next event of the bridge that is ready, without waiting.
    pub fn poll_event(&self) -> Result<Option<XEvent>, XwlError> {
        while let Some((event, sequence)) = self.conn.poll_for_event_with_sequence()? {
            let mut tracker = self.tracker.get();
            tracker.saw_event(sequence);
            self.tracker.set(tracker);

            if let Event::PropertyNotify(notify) = &event {
                if notify.window == self.sync_window {
                    continue;
                }
            }
            if let Some(event) = Self::translate_event(event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Picks the events the bridge is interested in.
    pub fn translate_event(event: Event) -> Option<XEvent> {
        match event {
            Event::XfixesSelectionNotify(event) => Some(XEvent::XfixesSelectionNotify(event)),
            Event::SelectionNotify(event) => Some(XEvent::SelectionNotify(event)),
            Event::SelectionRequest(event) => Some(XEvent::SelectionRequest(event)),
            Event::PropertyNotify(event) => Some(XEvent::PropertyNotify(event)),
            Event::ClientMessage(event) => Some(XEvent::ClientMessage(event)),
            _ => None,
        }
    }

    fn arrived(&self, sequence: SequenceNumber) -> bool {
        self.tracker.get().arrived(sequence)
    }

    /// Makes the server send us an event once everything before it is done.
    fn sync(&self) -> Result<(), XwlError> {
        self.conn.change_property8(
            PropMode::APPEND,
            self.sync_window,
            self.sync_atom,
            AtomEnum::STRING,
            &[],
        )?;
        Ok(())
    }

    fn collect<R: TryParse>(&self, sequence: SequenceNumber) -> Result<R, XwlError> {
        let buf = self.conn.wait_for_reply_or_error(sequence)?;
        let (reply, _) = R::try_parse(buf.as_ref()).map_err(ReplyError::from)?;
        Ok(reply)
    }

    fn cache_atom(&self, atom: Atom, name: String) {
        self.atoms_by_name.borrow_mut().insert(name.clone(), atom);
        self.atom_names.borrow_mut().insert(atom, name);
    }

    fn collect_atom_name(&self, atom: Atom, sequence: SequenceNumber) -> Result<String, XwlError> {
        let reply = self.collect::<GetAtomNameReply>(sequence)?;
        let name = String::from_utf8(reply.name).map_err(|_| XwlError::InvalidAtomName(atom))?;
        self.cache_atom(atom, name.clone());
        Ok(name)
    }

    fn collect_intern(&self, name: &str, sequence: SequenceNumber) -> Result<Atom, XwlError> {
        let atom = self.collect::<InternAtomReply>(sequence)?.atom;
        self.cache_atom(atom, name.to_string());
        Ok(atom)
    }

    /// Stores the atom lookups that already arrived.
    fn collect_atoms(&self) {
        let names = self
            .name_requests
            .borrow()
            .iter()
            .filter(|(_, sequence)| self.arrived(**sequence))
            .map(|(atom, sequence)| (*atom, *sequence))
            .collect::<Vec<_>>();
        for (atom, sequence) in names {
            self.name_requests.borrow_mut().remove(&atom);
            if let Err(err) = self.collect_atom_name(atom, sequence) {
                warn!(?err, atom, "Failed to read atom name.");
            }
        }

        let interns = self
            .intern_requests
            .borrow()
            .iter()
            .filter(|(_, sequence)| self.arrived(**sequence))
            .map(|(name, sequence)| (name.clone(), *sequence))
            .collect::<Vec<_>>();
        for (name, sequence) in interns {
            self.intern_requests.borrow_mut().remove(&name);
            if let Err(err) = self.collect_intern(&name, sequence) {
                warn!(?err, name, "Failed to intern atom.");
            }
        }
    }

    /// Asks for the names of unknown atoms in an atom list. Returns the atoms
    /// the reply has to wait for.
    fn request_names(&self, reply: &Option<GetPropertyReply>) -> Result<Vec<Atom>, XwlError> {
        let Some(atoms) = reply
            .as_ref()
            .filter(|reply| reply.type_ == u32::from(AtomEnum::ATOM))
            .and_then(|reply| reply.value32())
        else {
            return Ok(Vec::new());
        };

        let mut missing = Vec::new();
        for atom in atoms {
            if atom == NONE || self.atom_names.borrow().contains_key(&atom) {
                continue;
            }
            if !self.name_requests.borrow().contains_key(&atom) {
                let sequence = forget_cookie(self.conn.get_atom_name(atom)?);
                self.name_requests.borrow_mut().insert(atom, sequence);
            }
            missing.push(atom);
        }
        if !missing.is_empty() {
            self.sync()?;
            self.conn.flush()?;
        }
        Ok(missing)
    }

    fn read_property(&self, pending: PendingProperty) -> Option<GetPropertyReply> {
        match self.collect::<GetPropertyReply>(pending.sequence) {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(?err, window = pending.window, "Failed to read property.");
                None
            }
        }
    }

    /// A held back reply whose atom names are all known by now.
    fn take_named(&self) -> Option<XEvent> {
        let requests = self.name_requests.borrow();
        let index = self
            .named
            .borrow()
            .iter()
            .position(|entry| entry.atoms.iter().all(|atom| !requests.contains_key(atom)))?;
        drop(requests);
        let entry = self.named.borrow_mut().remove(index)?;
        Some(XEvent::PropertyReply {
            id: entry.id,
            reply: entry.reply,
        })
    }
}

/// Leaves the reply in the connection, to be collected by sequence number.
fn forget_cookie<C, R>(cookie: Cookie<'_, C, R>) -> SequenceNumber
where
    C: RequestConnection + ?Sized,
    R: TryParse,
{
    let sequence = cookie.sequence_number();
    // dropping the cookie would discard the reply
    std::mem::forget(cookie);
    sequence
}

impl<C: Connection> XConnection for X11rbConnection<C> {
    fn root(&self) -> Window {
        self.root
    }

    fn create_window(
        &self,
        parent: Window,
        loc: Point<i32, Logical>,
        size: Size<i32, Logical>,
        class: WindowClass,
        event_mask: EventMask,
    ) -> Result<Window, XwlError> {
        let window = self.conn.generate_id()?;
        self.conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            parent,
            loc.x as i16,
            loc.y as i16,
            size.w.max(1) as u16,
            size.h.max(1) as u16,
            0,
            class,
            COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(event_mask),
        )?;
        Ok(window)
    }

    fn destroy_window(&self, window: Window) -> Result<(), XwlError> {
        self.conn.destroy_window(window)?;
        Ok(())
    }

    fn map_window(&self, window: Window) -> Result<(), XwlError> {
        self.conn.map_window(window)?;
        Ok(())
    }

    fn unmap_window(&self, window: Window) -> Result<(), XwlError> {
        self.conn.unmap_window(window)?;
        Ok(())
    }

    fn raise_window(&self, window: Window) -> Result<(), XwlError> {
        self.conn.configure_window(
            window,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        )?;
        Ok(())
    }

    fn select_window_events(&self, window: Window, mask: EventMask) -> Result<(), XwlError> {
        self.conn.change_window_attributes(
            window,
            &ChangeWindowAttributesAux::new().event_mask(mask),
        )?;
        Ok(())
    }

    fn select_selection_events(&self, window: Window, selection: Atom) -> Result<(), XwlError> {
        self.conn.xfixes_select_selection_input(
            window,
            selection,
            SelectionEventMask::SET_SELECTION_OWNER
                | SelectionEventMask::SELECTION_WINDOW_DESTROY
                | SelectionEventMask::SELECTION_CLIENT_CLOSE,
        )?;
        Ok(())
    }

    fn set_selection_owner(
        &self,
        owner: Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<(), XwlError> {
        self.conn.set_selection_owner(owner, selection, time)?;
        Ok(())
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), XwlError> {
        self.conn
            .convert_selection(requestor, selection, target, property, time)?;
        Ok(())
    }

    fn change_property8(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), XwlError> {
        self.conn
            .change_property8(PropMode::REPLACE, window, property, type_, data)?;
        Ok(())
    }

    fn change_property32(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), XwlError> {
        self.conn
            .change_property32(PropMode::REPLACE, window, property, type_, data)?;
        Ok(())
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), XwlError> {
        self.conn.delete_property(window, property)?;
        Ok(())
    }

    fn get_property(&self, request: PropertyRequest) -> Result<(), XwlError> {
        let cookie = self.conn.get_property(
            request.delete,
            request.window,
            request.property,
            request.type_,
            0,
            request.long_length,
        )?;
        self.properties.borrow_mut().push_back(PendingProperty {
            id: request.id,
            window: request.window,
            sequence: forget_cookie(cookie),
        });
        self.sync()
    }

    fn poll_reply(&self) -> Option<XEvent> {
        self.collect_atoms();
        if let Some(event) = self.take_named() {
            return Some(event);
        }

        loop {
            let pending = {
                let mut properties = self.properties.borrow_mut();
                let ready = properties
                    .front()
                    .is_some_and(|front| self.arrived(front.sequence));
                if !ready {
                    return None;
                }
                properties.pop_front()?
            };
            let reply = self.read_property(pending);
            match self.request_names(&reply) {
                Ok(atoms) if !atoms.is_empty() => {
                    self.named.borrow_mut().push_back(PendingNames {
                        id: pending.id,
                        reply,
                        atoms,
                    });
                }
                Ok(_) => return Some(XEvent::PropertyReply { id: pending.id, reply }),
                Err(err) => {
                    warn!(?err, "Failed to look up atom names.");
                    return Some(XEvent::PropertyReply { id: pending.id, reply });
                }
            }
        }
    }

    fn send_client_message(
        &self,
        destination: Window,
        event: ClientMessageEvent,
    ) -> Result<(), XwlError> {
        self.conn
            .send_event(false, destination, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), XwlError> {
        self.conn
            .send_event(false, event.requestor, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn prefetch_atoms(&self, names: &[String]) -> Result<(), XwlError> {
        let mut sent = false;
        for name in names {
            if self.atoms_by_name.borrow().contains_key(name)
                || self.intern_requests.borrow().contains_key(name)
            {
                continue;
            }
            let sequence = forget_cookie(self.conn.intern_atom(false, name.as_bytes())?);
            self.intern_requests
                .borrow_mut()
                .insert(name.clone(), sequence);
            sent = true;
        }
        if sent {
            self.sync()?;
        }
        Ok(())
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, XwlError> {
        if let Some(atom) = self.atoms_by_name.borrow().get(name) {
            return Ok(*atom);
        }
        let prefetched = self.intern_requests.borrow_mut().remove(name);
        let sequence = match prefetched {
            Some(sequence) => sequence,
            None => {
                debug!(name, "Interning atom that was not prefetched.");
                forget_cookie(self.conn.intern_atom(false, name.as_bytes())?)
            }
        };
        self.collect_intern(name, sequence)
    }

    fn atom_name(&self, atom: Atom) -> Result<String, XwlError> {
        if let Some(name) = self.atom_names.borrow().get(&atom) {
            return Ok(name.clone());
        }
        let requested = self.name_requests.borrow_mut().remove(&atom);
        let sequence = match requested {
            Some(sequence) => sequence,
            None => {
                debug!(atom, "Looking up atom name that was not prefetched.");
                forget_cookie(self.conn.get_atom_name(atom)?)
            }
        };
        self.collect_atom_name(atom, sequence)
    }

    fn flush(&self) -> Result<(), XwlError> {
        self.conn.flush()?;
        Ok(())
    }
}
