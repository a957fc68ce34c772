// SPDX-License-Identifier: GPL-3.0-only

//! Clipboard, primary selection and drag-and-drop between Xwayland and
//! Wayland clients.
//!
//! The compositor owns a [`DataBridge`], feeds it the X11 events of the
//! bridge's connection and the seat's selection and drag changes, and
//! answers its questions through [`BridgeHandler`].

use std::{os::fd::AsFd, rc::Rc, time::Duration, time::Instant};

use calloop::{
    generic::Generic,
    timer::{TimeoutAction, Timer},
    Interest, LoopHandle, Mode, PostAction, RegistrationToken,
};
use cosmic_xwl_bridge_config::BridgeConfig;
use smithay::utils::{Logical, Point, Serial};
use tracing::{debug, info, trace, warn};
use x11rb::{connection::Connection, protocol::xproto::Window};

mod atoms;
mod conn;
mod data_source;
mod dnd;
mod selection;
mod sources;
mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use self::{
    atoms::Atoms,
    conn::{PropertyRequest, RequestId, X11rbConnection, XConnection, XEvent, XwlError},
    data_source::{DataSource, DndAction, DndActions, SourceEvent, XwlDataSource},
    dnd::DragEventReply,
};
use self::{data_source::SourceQueue, dnd::Dnd, selection::Clipboard};

/// Everything a bridge component needs to talk to the X server.
#[derive(Clone, Copy)]
pub(crate) struct BridgeCtx<'a> {
    pub conn: &'a dyn XConnection,
    pub atoms: &'a Atoms,
    pub config: &'a BridgeConfig,
}

/// Identifies a toplevel the compositor knows of, X11 or Wayland.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    /// The X11 window, for Xwayland windows.
    pub x11_window: Option<Window>,
    pub xwayland: bool,
}

/// The Wayland selections that have an X11 counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionTarget {
    Clipboard,
    Primary,
}

/// The compositor side of the bridge.
pub trait BridgeHandler {
    /// Current seat selection for `target`.
    fn selection(&self, target: SelectionTarget) -> Option<Rc<dyn DataSource>>;
    fn set_selection(&mut self, target: SelectionTarget, source: Option<Rc<dyn DataSource>>);

    /// Whether the window with keyboard focus is an Xwayland window.
    fn active_window_is_x11(&self) -> bool;
    fn pointer_focus_is_xwayland(&self) -> bool;
    fn is_left_button_pressed(&self) -> bool;
    fn pointer_location(&self) -> Point<f64, Logical>;

    /// Starts a seat drag on behalf of an X11 client.
    fn start_drag(&mut self, source: Rc<dyn DataSource>);
    /// Source of the running seat drag.
    fn drag_source(&self) -> Option<Rc<dyn DataSource>>;
    /// Moves the drag focus of an X11 sourced drag to `window`.
    fn set_drag_target(&mut self, window: Option<WindowId>);

    fn window(&self, id: WindowId) -> Option<WindowInfo>;
}

#[derive(Debug, Default)]
struct Parts {
    clipboard: Option<Clipboard>,
    primary: Option<Clipboard>,
    dnd: Option<Dnd>,
}

impl Parts {
    fn clipboards_mut(&mut self) -> impl Iterator<Item = &mut Clipboard> {
        self.clipboard.iter_mut().chain(self.primary.iter_mut())
    }

    fn clipboard_mut(&mut self, target: SelectionTarget) -> Option<&mut Clipboard> {
        match target {
            SelectionTarget::Clipboard => self.clipboard.as_mut(),
            SelectionTarget::Primary => self.primary.as_mut(),
        }
    }
}

/// Selection bridge of one Xwayland instance.
#[derive(Debug)]
pub struct DataBridge<C: XConnection> {
    conn: C,
    atoms: Atoms,
    config: BridgeConfig,
    queue: SourceQueue,
    parts: Parts,
}

impl<C: XConnection> DataBridge<C> {
    pub fn new(conn: C, atoms: Atoms, config: BridgeConfig) -> Result<DataBridge<C>, XwlError> {
        let queue = SourceQueue::default();
        let ctx = BridgeCtx {
            conn: &conn,
            atoms: &atoms,
            config: &config,
        };
        let parts = Parts {
            clipboard: config
                .clipboard
                .then(|| Clipboard::new(&ctx, SelectionTarget::Clipboard, &queue))
                .transpose()?,
            primary: config
                .primary_selection
                .then(|| Clipboard::new(&ctx, SelectionTarget::Primary, &queue))
                .transpose()?,
            dnd: config
                .drag_and_drop
                .then(|| Dnd::new(&ctx, &queue))
                .transpose()?,
        };
        info!(
            clipboard = config.clipboard,
            primary = config.primary_selection,
            dnd = config.drag_and_drop,
            "Started Xwayland selection bridge."
        );

        Ok(DataBridge {
            conn,
            atoms,
            config,
            queue,
            parts,
        })
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn split(&mut self) -> (BridgeCtx<'_>, &mut Parts) {
        (
            BridgeCtx {
                conn: &self.conn,
                atoms: &self.atoms,
                config: &self.config,
            },
            &mut self.parts,
        )
    }

    /// Processes an X11 event. Returns whether the bridge consumed it.
    pub fn handle_x_event(&mut self, handler: &mut dyn BridgeHandler, event: &XEvent) -> bool {
        let now = Instant::now();
        let (ctx, parts) = self.split();
        let handled = route_x_event(&ctx, parts, handler, event, now);
        self.dispatch_pending(handler);
        handled
    }

    /// The seat selection or primary selection changed.
    pub fn wl_selection_changed(
        &mut self,
        handler: &mut dyn BridgeHandler,
        target: SelectionTarget,
    ) {
        let (ctx, parts) = self.split();
        if let Some(clipboard) = parts.clipboard_mut(target) {
            clipboard.wl_selection_changed(&ctx, handler);
        }
    }

    /// Keyboard focus moved, X11 access to Wayland selections may change.
    pub fn active_window_changed(&mut self, handler: &mut dyn BridgeHandler) {
        let (ctx, parts) = self.split();
        for clipboard in parts.clipboards_mut() {
            clipboard.check_wl_source(&ctx, handler);
        }
    }

    pub fn drag_started(&mut self, handler: &mut dyn BridgeHandler) {
        let (ctx, parts) = self.split();
        if let Some(dnd) = parts.dnd.as_mut() {
            dnd.drag_started(&ctx, handler);
        }
    }

    pub fn drag_ended(&mut self) {
        let (ctx, parts) = self.split();
        if let Some(dnd) = parts.dnd.as_mut() {
            dnd.drag_ended(&ctx);
        }
    }

    /// Pointer motion during a drag, over `target`. The position is taken from
    /// [`BridgeHandler::pointer_location`].
    pub fn drag_move_filter(
        &mut self,
        handler: &mut dyn BridgeHandler,
        target: Option<WindowId>,
    ) -> DragEventReply {
        let (ctx, parts) = self.split();
        match parts.dnd.as_mut() {
            Some(dnd) => dnd.drag_move_filter(&ctx, handler, target),
            None => DragEventReply::Wayland,
        }
    }

    /// The seat's drag focus moved to `target`.
    pub fn update_drag_target(
        &mut self,
        handler: &dyn BridgeHandler,
        target: Option<WindowId>,
        serial: Serial,
    ) {
        let (ctx, parts) = self.split();
        if let Some(dnd) = parts.dnd.as_mut() {
            dnd.update_drag_target(&ctx, handler, target, serial);
        }
    }

    /// The seat dropped onto the current drag target.
    pub fn drop(&mut self) {
        let (ctx, parts) = self.split();
        if let Some(dnd) = parts.dnd.as_mut() {
            dnd.drop(&ctx);
        }
    }

    /// Handles queued data source events and property replies.
    pub fn dispatch_pending(&mut self, handler: &mut dyn BridgeHandler) {
        let now = Instant::now();
        loop {
            let (ctx, parts) = self.split();
            if let Some(reply) = ctx.conn.poll_reply() {
                route_x_event(&ctx, parts, handler, &reply, now);
                continue;
            }
            // never hold the queue while dispatching, sources push into it
            let Some(event) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            let (ctx, parts) = self.split();
            route_source_event(&ctx, parts, handler, event, now);
        }
    }

    /// Drives transfers and timeouts.
    pub fn refresh(&mut self, handler: &mut dyn BridgeHandler) {
        self.refresh_at(handler, Instant::now());
    }

    pub fn refresh_at(&mut self, handler: &mut dyn BridgeHandler, now: Instant) {
        let (ctx, parts) = self.split();
        for clipboard in parts.clipboards_mut() {
            clipboard.refresh(&ctx, handler, now);
        }
        if let Some(dnd) = parts.dnd.as_mut() {
            dnd.refresh(&ctx, now);
        }
        self.dispatch_pending(handler);
    }

    /// Xwayland is gone, forget everything without talking to it.
    pub fn xwayland_lost(&mut self, handler: &mut dyn BridgeHandler) {
        debug!("Xwayland lost, shutting down selection bridge.");
        let clipboards = self.parts.clipboard.take().into_iter();
        for mut clipboard in clipboards.chain(self.parts.primary.take()) {
            clipboard.clear(handler);
        }
        if let Some(mut dnd) = self.parts.dnd.take() {
            dnd.clear();
        }
        self.queue.borrow_mut().clear();
    }

    /// Destroys the bridge's windows.
    pub fn destroy(mut self) -> Result<(), XwlError> {
        let parts = std::mem::take(&mut self.parts);
        let ctx = BridgeCtx {
            conn: &self.conn,
            atoms: &self.atoms,
            config: &self.config,
        };
        for clipboard in parts.clipboard.into_iter().chain(parts.primary) {
            clipboard.destroy(&ctx)?;
        }
        if let Some(dnd) = parts.dnd {
            dnd.destroy(&ctx)?;
        }
        Ok(())
    }
}

fn route_x_event(
    ctx: &BridgeCtx<'_>,
    parts: &mut Parts,
    handler: &mut dyn BridgeHandler,
    event: &XEvent,
    now: Instant,
) -> bool {
    if parts
        .clipboards_mut()
        .any(|clipboard| clipboard.handle_x_event(ctx, handler, event, now))
    {
        return true;
    }
    if let Some(dnd) = parts.dnd.as_mut() {
        if dnd.handle_x_event(ctx, handler, event, now) {
            return true;
        }
    }
    trace!(?event, "Unhandled X11 event.");
    false
}

fn route_source_event(
    ctx: &BridgeCtx<'_>,
    parts: &mut Parts,
    handler: &mut dyn BridgeHandler,
    event: SourceEvent,
    now: Instant,
) {
    let id = event.source();
    if let Some(clipboard) = parts
        .clipboards_mut()
        .find(|clipboard| clipboard.owns_source(id))
    {
        if let SourceEvent::DataRequested { mime_type, fd, .. } = event {
            clipboard.start_transfer(ctx, handler, &mime_type, fd, now);
        }
        return;
    }
    if let Some(dnd) = parts.dnd.as_mut() {
        if dnd.handle_source_event(ctx, event, now) {
            return;
        }
    }
    trace!(source = ?id, "Event of a retired data source.");
}

impl<C: Connection> DataBridge<X11rbConnection<C>> {
    /// Handles the X11 events and replies that already arrived.
    pub fn dispatch_x_events(&mut self, handler: &mut dyn BridgeHandler) -> Result<(), XwlError> {
        while let Some(event) = self.conn.poll_event()? {
            self.handle_x_event(handler, &event);
        }
        self.dispatch_pending(handler);
        self.conn.flush()
    }
}

/// Calls `ready` whenever the X11 connection behind `fd` can be read.
///
/// x11rb may already hold events it read while waiting for a reply, so this
/// is usually paired with [`insert_refresh_timer`].
pub fn insert_x11_source<'l, D, F>(
    handle: &LoopHandle<'l, D>,
    fd: impl AsFd,
    mut ready: F,
) -> Result<RegistrationToken, calloop::Error>
where
    F: FnMut(&mut D) + 'l,
{
    let fd = rustix::io::dup(fd).map_err(|err| calloop::Error::IoError(err.into()))?;
    handle
        .insert_source(
            Generic::new(fd, Interest::READ, Mode::Level),
            move |_, _, data| {
                ready(data);
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| {
            let error = err.error;
            warn!(?error, "Failed to insert X11 connection source.");
            error
        })
}

/// Calls `refresh` every `interval` on the event loop of `handle`.
pub fn insert_refresh_timer<'l, D, F>(
    handle: &LoopHandle<'l, D>,
    interval: Duration,
    mut refresh: F,
) -> Result<RegistrationToken, calloop::Error>
where
    F: FnMut(&mut D) + 'l,
{
    handle
        .insert_source(Timer::from_duration(interval), move |_, _, data| {
            refresh(data);
            TimeoutAction::ToDuration(interval)
        })
        .map_err(|err| {
            let error = err.error;
            warn!(?error, "Failed to insert selection bridge timer.");
            error
        })
}
