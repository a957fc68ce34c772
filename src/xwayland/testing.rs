// SPDX-License-Identifier: GPL-3.0-only

//! Recording X11 connection and seat doubles for unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    os::fd::OwnedFd,
    rc::Rc,
};

use cosmic_xwl_bridge_config::BridgeConfig;
use smithay::utils::{Logical, Point, Size};
use x11rb::CURRENT_TIME;
use x11rb::protocol::{
    xfixes::{self, SelectionEvent},
    xproto::{
        Atom, AtomEnum, ClientMessageEvent, EventMask, GetPropertyReply, Property,
        PropertyNotifyEvent, SelectionNotifyEvent, SelectionRequestEvent, Timestamp, Window,
        WindowClass, PROPERTY_NOTIFY_EVENT, SELECTION_REQUEST_EVENT,
    },
};

use super::{
    atoms::Atoms,
    conn::{PropertyRequest, RequestId, XConnection, XEvent, XwlError},
    data_source::{DataSource, DndAction, DndActions, SourceQueue},
    BridgeCtx, BridgeHandler, SelectionTarget, WindowId, WindowInfo,
};

pub const ROOT: Window = 0x1;

/// A request sent through [`MockConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateWindow {
        window: Window,
        parent: Window,
        size: Size<i32, Logical>,
        class: WindowClass,
        event_mask: EventMask,
    },
    DestroyWindow(Window),
    MapWindow(Window),
    UnmapWindow(Window),
    RaiseWindow(Window),
    SelectWindowEvents {
        window: Window,
        mask: EventMask,
    },
    SelectSelectionEvents {
        window: Window,
        selection: Atom,
    },
    SetSelectionOwner {
        owner: Window,
        selection: Atom,
        time: Timestamp,
    },
    ConvertSelection {
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    },
    ChangeProperty8 {
        window: Window,
        property: Atom,
        type_: Atom,
        data: Vec<u8>,
    },
    ChangeProperty32 {
        window: Window,
        property: Atom,
        type_: Atom,
        data: Vec<u32>,
    },
    DeleteProperty {
        window: Window,
        property: Atom,
    },
    GetProperty(PropertyRequest),
    ClientMessage {
        destination: Window,
        type_: Atom,
        data: [u32; 5],
    },
    SelectionNotify(SelectionNotifyEvent),
}

#[derive(Debug)]
pub struct MockConnection {
    requests: RefCell<Vec<Request>>,
    replies: RefCell<VecDeque<XEvent>>,
    next_window: Cell<Window>,
    atoms_by_name: RefCell<HashMap<String, Atom>>,
    atom_names: RefCell<HashMap<Atom, String>>,
    next_atom: Cell<Atom>,
    prefetched: RefCell<Vec<String>>,
}

impl MockConnection {
    pub fn new() -> MockConnection {
        MockConnection {
            requests: RefCell::new(Vec::new()),
            replies: RefCell::new(VecDeque::new()),
            next_window: Cell::new(0x0020_0000),
            atoms_by_name: RefCell::new(HashMap::new()),
            atom_names: RefCell::new(HashMap::new()),
            // clear of the predefined atoms
            next_atom: Cell::new(100),
            prefetched: RefCell::new(Vec::new()),
        }
    }

    /// Atom for `name`, allocated on first use.
    pub fn intern(&self, name: &str) -> Atom {
        if let Some(atom) = self.atoms_by_name.borrow().get(name) {
            return *atom;
        }
        let atom = self.next_atom.get();
        self.next_atom.set(atom + 1);
        self.atoms_by_name.borrow_mut().insert(name.to_string(), atom);
        self.atom_names.borrow_mut().insert(atom, name.to_string());
        atom
    }

    pub fn atoms(&self) -> Atoms {
        let atom = |name: &str| self.intern(name);
        Atoms {
            CLIPBOARD: atom("CLIPBOARD"),
            PRIMARY: atom("PRIMARY"),
            XdndSelection: atom("XdndSelection"),
            TARGETS: atom("TARGETS"),
            MULTIPLE: atom("MULTIPLE"),
            TIMESTAMP: atom("TIMESTAMP"),
            SAVE_TARGETS: atom("SAVE_TARGETS"),
            DELETE: atom("DELETE"),
            INCR: atom("INCR"),
            UTF8_STRING: atom("UTF8_STRING"),
            TEXT: atom("TEXT"),
            URI_LIST: atom("text/uri-list"),
            NETSCAPE_URL: atom("_NETSCAPE_URL"),
            MOZ_URL: atom("text/x-moz-url"),
            WL_SELECTION: atom("WL_SELECTION"),
            XdndAware: atom("XdndAware"),
            XdndTypeList: atom("XdndTypeList"),
            XdndEnter: atom("XdndEnter"),
            XdndPosition: atom("XdndPosition"),
            XdndStatus: atom("XdndStatus"),
            XdndDrop: atom("XdndDrop"),
            XdndLeave: atom("XdndLeave"),
            XdndFinished: atom("XdndFinished"),
            XdndActionCopy: atom("XdndActionCopy"),
            XdndActionMove: atom("XdndActionMove"),
            XdndActionAsk: atom("XdndActionAsk"),
        }
    }

    /// Drains the recorded requests.
    pub fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.borrow_mut())
    }

    pub fn last_property_request(&self) -> Option<PropertyRequest> {
        self.requests.borrow().iter().rev().find_map(|request| match request {
            Request::GetProperty(request) => Some(*request),
            _ => None,
        })
    }

    /// Drains the recorded requests, keeping the client messages.
    pub fn take_prefetched(&self) -> Vec<String> {
        std::mem::take(&mut *self.prefetched.borrow_mut())
    }

    pub fn take_client_messages(&self) -> Vec<(Window, Atom, [u32; 5])> {
        self.take_requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::ClientMessage {
                    destination,
                    type_,
                    data,
                } => Some((destination, type_, data)),
                _ => None,
            })
            .collect()
    }

    /// Makes the reply to a property read available to [`XConnection::poll_reply`].
    pub fn queue_reply(&self, id: RequestId, reply: Option<GetPropertyReply>) {
        self.replies
            .borrow_mut()
            .push_back(XEvent::PropertyReply { id, reply });
    }

    fn record(&self, request: Request) -> Result<(), XwlError> {
        self.requests.borrow_mut().push(request);
        Ok(())
    }
}

impl XConnection for MockConnection {
    fn root(&self) -> Window {
        ROOT
    }

    fn create_window(
        &self,
        parent: Window,
        _loc: Point<i32, Logical>,
        size: Size<i32, Logical>,
        class: WindowClass,
        event_mask: EventMask,
    ) -> Result<Window, XwlError> {
        let window = self.next_window.get();
        self.next_window.set(window + 1);
        self.record(Request::CreateWindow {
            window,
            parent,
            size,
            class,
            event_mask,
        })?;
        Ok(window)
    }

    fn destroy_window(&self, window: Window) -> Result<(), XwlError> {
        self.record(Request::DestroyWindow(window))
    }

    fn map_window(&self, window: Window) -> Result<(), XwlError> {
        self.record(Request::MapWindow(window))
    }

    fn unmap_window(&self, window: Window) -> Result<(), XwlError> {
        self.record(Request::UnmapWindow(window))
    }

    fn raise_window(&self, window: Window) -> Result<(), XwlError> {
        self.record(Request::RaiseWindow(window))
    }

    fn select_window_events(&self, window: Window, mask: EventMask) -> Result<(), XwlError> {
        self.record(Request::SelectWindowEvents { window, mask })
    }

    fn select_selection_events(&self, window: Window, selection: Atom) -> Result<(), XwlError> {
        self.record(Request::SelectSelectionEvents { window, selection })
    }

    fn set_selection_owner(
        &self,
        owner: Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<(), XwlError> {
        self.record(Request::SetSelectionOwner {
            owner,
            selection,
            time,
        })
    }

    fn convert_selection(
        &self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<(), XwlError> {
        self.record(Request::ConvertSelection {
            requestor,
            selection,
            target,
            property,
            time,
        })
    }

    fn change_property8(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), XwlError> {
        self.record(Request::ChangeProperty8 {
            window,
            property,
            type_,
            data: data.to_vec(),
        })
    }

    fn change_property32(
        &self,
        window: Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), XwlError> {
        self.record(Request::ChangeProperty32 {
            window,
            property,
            type_,
            data: data.to_vec(),
        })
    }

    fn delete_property(&self, window: Window, property: Atom) -> Result<(), XwlError> {
        self.record(Request::DeleteProperty { window, property })
    }

    fn get_property(&self, request: PropertyRequest) -> Result<(), XwlError> {
        self.record(Request::GetProperty(request))
    }

    fn poll_reply(&self) -> Option<XEvent> {
        self.replies.borrow_mut().pop_front()
    }

    fn send_client_message(
        &self,
        destination: Window,
        event: ClientMessageEvent,
    ) -> Result<(), XwlError> {
        self.record(Request::ClientMessage {
            destination,
            type_: event.type_,
            data: event.data.as_data32(),
        })
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), XwlError> {
        self.record(Request::SelectionNotify(event))
    }

    fn prefetch_atoms(&self, names: &[String]) -> Result<(), XwlError> {
        self.prefetched.borrow_mut().extend_from_slice(names);
        Ok(())
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, XwlError> {
        Ok(self.intern(name))
    }

    fn atom_name(&self, atom: Atom) -> Result<String, XwlError> {
        self.atom_names
            .borrow()
            .get(&atom)
            .cloned()
            .ok_or(XwlError::InvalidAtomName(atom))
    }

    fn flush(&self) -> Result<(), XwlError> {
        Ok(())
    }
}

/// Connection, atoms and config a unit under test runs against.
pub struct Harness {
    pub conn: MockConnection,
    pub atoms: Atoms,
    pub config: BridgeConfig,
    pub queue: SourceQueue,
}

impl Harness {
    pub fn new() -> Harness {
        let conn = MockConnection::new();
        let atoms = conn.atoms();
        Harness {
            conn,
            atoms,
            config: BridgeConfig::default(),
            queue: SourceQueue::default(),
        }
    }

    pub fn ctx(&self) -> BridgeCtx<'_> {
        BridgeCtx {
            conn: &self.conn,
            atoms: &self.atoms,
            config: &self.config,
        }
    }
}

pub fn selection_request(
    owner: Window,
    requestor: Window,
    selection: Atom,
    target: Atom,
    property: Atom,
) -> SelectionRequestEvent {
    SelectionRequestEvent {
        response_type: SELECTION_REQUEST_EVENT,
        sequence: 0,
        time: CURRENT_TIME,
        owner,
        requestor,
        selection,
        target,
        property,
    }
}

pub fn xfixes_notify(
    window: Window,
    owner: Window,
    selection: Atom,
    timestamp: Timestamp,
) -> xfixes::SelectionNotifyEvent {
    xfixes::SelectionNotifyEvent {
        response_type: 0,
        subtype: SelectionEvent::SET_SELECTION_OWNER,
        sequence: 0,
        window,
        owner,
        selection,
        timestamp,
        selection_timestamp: timestamp,
    }
}

pub fn property_notify(window: Window, atom: Atom, state: Property) -> PropertyNotifyEvent {
    PropertyNotifyEvent {
        response_type: PROPERTY_NOTIFY_EVENT,
        sequence: 0,
        window,
        atom,
        time: CURRENT_TIME,
        state,
    }
}

pub fn client_message(window: Window, type_: Atom, data: [u32; 5]) -> ClientMessageEvent {
    ClientMessageEvent::new(32, window, type_, data)
}

/// Reply with a list of 32 bit values of type `ATOM`.
pub fn targets_reply(values: &[u32]) -> GetPropertyReply {
    GetPropertyReply {
        format: 32,
        sequence: 0,
        length: values.len() as u32,
        type_: AtomEnum::ATOM.into(),
        bytes_after: 0,
        value_len: values.len() as u32,
        value: values.iter().flat_map(|value| value.to_ne_bytes()).collect(),
    }
}

pub fn property_reply(type_: Atom, data: &[u8]) -> GetPropertyReply {
    GetPropertyReply {
        format: 8,
        sequence: 0,
        length: data.len().div_ceil(4) as u32,
        type_,
        bytes_after: 0,
        value_len: data.len() as u32,
        value: data.to_vec(),
    }
}

/// Reads `fd` until the write end is closed.
pub fn read_all(fd: &OwnedFd) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(0) => return data,
            Ok(len) => data.extend_from_slice(&buf[..len]),
            Err(rustix::io::Errno::INTR) => continue,
            Err(err) => panic!("reading pipe failed: {err}"),
        }
    }
}

/// A Wayland client's data source.
#[derive(Debug)]
pub struct TestSource {
    mime_types: Vec<String>,
    actions: Cell<DndActions>,
    requested: RefCell<Vec<String>>,
    accepted: RefCell<Option<String>>,
    action: Cell<DndAction>,
    finished: Cell<usize>,
}

impl TestSource {
    pub fn new(mime_types: &[&str]) -> Rc<TestSource> {
        Rc::new(TestSource {
            mime_types: mime_types.iter().map(|mime| mime.to_string()).collect(),
            actions: Cell::new(DndActions::COPY),
            requested: RefCell::new(Vec::new()),
            accepted: RefCell::new(None),
            action: Cell::new(DndAction::None),
            finished: Cell::new(0),
        })
    }

    pub fn set_supported_actions(&self, actions: DndActions) {
        self.actions.set(actions);
    }

    pub fn requested_mimes(&self) -> Vec<String> {
        self.requested.borrow().clone()
    }

    pub fn accepted(&self) -> Option<String> {
        self.accepted.borrow().clone()
    }

    pub fn dnd_action(&self) -> DndAction {
        self.action.get()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.get()
    }
}

impl DataSource for TestSource {
    fn mime_types(&self) -> Vec<String> {
        self.mime_types.clone()
    }

    fn request_data(&self, mime_type: &str, _fd: OwnedFd) {
        self.requested.borrow_mut().push(mime_type.to_string());
    }

    fn accept(&self, mime_type: Option<&str>) {
        *self.accepted.borrow_mut() = mime_type.map(str::to_string);
    }

    fn supported_actions(&self) -> DndActions {
        self.actions.get()
    }

    fn set_dnd_action(&self, action: DndAction) {
        self.action.set(action);
    }

    fn drop_performed(&self) {}

    fn dnd_finished(&self) {
        self.finished.set(self.finished.get() + 1);
    }

    fn cancel(&self) {}
}

/// Seat and window state of the compositor.
pub struct MockHandler {
    pub active_x11: bool,
    pub pointer_on_xwayland: bool,
    pub left_button: bool,
    pub pointer: Point<f64, Logical>,
    pub clipboard: Option<Rc<dyn DataSource>>,
    pub primary: Option<Rc<dyn DataSource>>,
    pub drag: Option<Rc<dyn DataSource>>,
    pub drag_target: Option<WindowId>,
    pub started_drags: usize,
    pub windows: HashMap<WindowId, WindowInfo>,
}

impl Default for MockHandler {
    fn default() -> MockHandler {
        MockHandler {
            active_x11: false,
            pointer_on_xwayland: false,
            left_button: false,
            pointer: Point::from((0.0, 0.0)),
            clipboard: None,
            primary: None,
            drag: None,
            drag_target: None,
            started_drags: 0,
            windows: HashMap::new(),
        }
    }
}

impl BridgeHandler for MockHandler {
    fn selection(&self, target: SelectionTarget) -> Option<Rc<dyn DataSource>> {
        match target {
            SelectionTarget::Clipboard => self.clipboard.clone(),
            SelectionTarget::Primary => self.primary.clone(),
        }
    }

    fn set_selection(&mut self, target: SelectionTarget, source: Option<Rc<dyn DataSource>>) {
        match target {
            SelectionTarget::Clipboard => self.clipboard = source,
            SelectionTarget::Primary => self.primary = source,
        }
    }

    fn active_window_is_x11(&self) -> bool {
        self.active_x11
    }

    fn pointer_focus_is_xwayland(&self) -> bool {
        self.pointer_on_xwayland
    }

    fn is_left_button_pressed(&self) -> bool {
        self.left_button
    }

    fn pointer_location(&self) -> Point<f64, Logical> {
        self.pointer
    }

    fn start_drag(&mut self, source: Rc<dyn DataSource>) {
        self.started_drags += 1;
        self.drag = Some(source);
    }

    fn drag_source(&self) -> Option<Rc<dyn DataSource>> {
        self.drag.clone()
    }

    fn set_drag_target(&mut self, target: Option<WindowId>) {
        self.drag_target = target;
    }

    fn window(&self, id: WindowId) -> Option<WindowInfo> {
        self.windows.get(&id).copied()
    }
}
