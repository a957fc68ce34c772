// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    os::fd::OwnedFd,
    rc::{Rc, Weak},
    sync::atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;
use tracing::{trace, warn};

bitflags! {
    /// Drag-and-drop actions a source supports, as on `wl_data_device_manager`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DndActions: u32 {
        const COPY = 1;
        const MOVE = 2;
        const ASK = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DndAction {
    #[default]
    None,
    Copy,
    Move,
    Ask,
}

impl DndAction {
    pub fn is_supported_by(self, actions: DndActions) -> bool {
        match self {
            DndAction::None => false,
            DndAction::Copy => actions.contains(DndActions::COPY),
            DndAction::Move => actions.contains(DndActions::MOVE),
            DndAction::Ask => actions.contains(DndActions::ASK),
        }
    }
}

impl From<DndAction> for DndActions {
    fn from(action: DndAction) -> DndActions {
        match action {
            DndAction::None => DndActions::empty(),
            DndAction::Copy => DndActions::COPY,
            DndAction::Move => DndActions::MOVE,
            DndAction::Ask => DndActions::ASK,
        }
    }
}

/// A data source as seen by the Wayland seat.
///
/// Wayland clients' sources are provided by the compositor, the bridge
/// publishes X11 selections through [`XwlDataSource`].
pub trait DataSource {
    fn mime_types(&self) -> Vec<String>;
    /// Asks the source to write the data for `mime_type` into `fd`.
    fn request_data(&self, mime_type: &str, fd: OwnedFd);
    /// The drop target accepts `mime_type`, or nothing.
    fn accept(&self, mime_type: Option<&str>);
    fn supported_actions(&self) -> DndActions;
    /// Action negotiated for the current drop target.
    fn set_dnd_action(&self, action: DndAction);
    fn drop_performed(&self);
    fn dnd_finished(&self);
    fn cancel(&self);
}

static NEXT_SOURCE_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

/// Notifications of an [`XwlDataSource`], queued until the bridge dispatches them.
#[derive(Debug)]
pub enum SourceEvent {
    DataRequested {
        source: SourceId,
        mime_type: String,
        fd: OwnedFd,
    },
    Dropped(SourceId),
    Finished(SourceId),
    Cancelled(SourceId),
    Destroyed(SourceId),
}

impl SourceEvent {
    pub fn source(&self) -> SourceId {
        match self {
            SourceEvent::DataRequested { source, .. } => *source,
            SourceEvent::Dropped(source)
            | SourceEvent::Finished(source)
            | SourceEvent::Cancelled(source)
            | SourceEvent::Destroyed(source) => *source,
        }
    }
}

pub(crate) type SourceQueue = Rc<RefCell<VecDeque<SourceEvent>>>;

/// Data source backed by an X11 selection owner.
#[derive(Debug)]
pub struct XwlDataSource {
    id: SourceId,
    mime_types: RefCell<Vec<String>>,
    supported_actions: Cell<DndActions>,
    selected_action: Cell<DndAction>,
    accepted: Cell<bool>,
    queue: Weak<RefCell<VecDeque<SourceEvent>>>,
}

impl XwlDataSource {
    pub(crate) fn new(queue: &SourceQueue, mime_types: Vec<String>) -> Rc<XwlDataSource> {
        Rc::new(XwlDataSource {
            id: SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)),
            mime_types: RefCell::new(mime_types),
            supported_actions: Cell::new(DndActions::COPY),
            selected_action: Cell::new(DndAction::None),
            accepted: Cell::new(false),
            queue: Rc::downgrade(queue),
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn set_mime_types(&self, mime_types: Vec<String>) {
        *self.mime_types.borrow_mut() = mime_types;
    }

    pub fn set_supported_actions(&self, actions: DndActions) {
        self.supported_actions.set(actions);
    }

    /// Action picked by the seat for this source.
    pub fn selected_action(&self) -> DndAction {
        self.selected_action.get()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.get()
    }

    /// Whether `source` is this very object.
    pub fn is(&self, source: &Rc<dyn DataSource>) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(source), self as *const XwlDataSource)
    }

    fn push(&self, event: SourceEvent) {
        if let Some(queue) = self.queue.upgrade() {
            match queue.try_borrow_mut() {
                Ok(mut queue) => {
                    trace!(?event, "Queued data source event.");
                    queue.push_back(event);
                }
                Err(_) => warn!(?event, "Dropped data source event during dispatch."),
            }
        }
    }
}

impl DataSource for XwlDataSource {
    fn mime_types(&self) -> Vec<String> {
        self.mime_types.borrow().clone()
    }

    fn request_data(&self, mime_type: &str, fd: OwnedFd) {
        self.push(SourceEvent::DataRequested {
            source: self.id,
            mime_type: mime_type.to_string(),
            fd,
        });
    }

    fn accept(&self, mime_type: Option<&str>) {
        self.accepted.set(mime_type.is_some_and(|mime| !mime.is_empty()));
    }

    fn supported_actions(&self) -> DndActions {
        self.supported_actions.get()
    }

    fn set_dnd_action(&self, action: DndAction) {
        self.selected_action.set(action);
    }

    fn drop_performed(&self) {
        self.push(SourceEvent::Dropped(self.id));
    }

    fn dnd_finished(&self) {
        self.push(SourceEvent::Finished(self.id));
    }

    fn cancel(&self) {
        self.push(SourceEvent::Cancelled(self.id));
    }
}

impl Drop for XwlDataSource {
    fn drop(&mut self) {
        self.push(SourceEvent::Destroyed(self.id));
    }
}
