// SPDX-License-Identifier: GPL-3.0-only

//! XDND, bridged to Wayland drag-and-drop.
//!
//! X11 sourced drags are [`XToWlDrag`]s visiting Wayland windows through
//! proxy windows, Wayland sourced drags are [`WlToXDrag`]s visiting X11
//! windows directly.

use std::{os::fd::OwnedFd, rc::Rc, time::Instant};

use smithay::utils::{Serial, Size};
use tracing::{debug, trace, warn};
use x11rb::{
    protocol::xproto::{
        Atom, AtomEnum, ClientMessageEvent, EventMask, GetPropertyReply, Window, WindowClass,
    },
    NONE,
};

use super::{
    atoms::{prefetch_mime_atoms, Atoms},
    conn::{RequestId, XEvent, XwlError},
    data_source::{DndAction, SourceEvent, SourceId, SourceQueue, XwlDataSource},
    selection::{OwnerChange, Selection, SelectionKind, SelectionUpdate},
    sources::WlSource,
    BridgeCtx, BridgeHandler, WindowId,
};

mod drop_handler;
mod wl_to_x;
mod wl_visit;
mod x_to_wl;
mod xvisit;

use self::{wl_to_x::WlToXDrag, x_to_wl::XToWlDrag};

/// Who handles pointer events during a drag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragEventReply {
    /// X11 handles the event, the seat must not.
    Ignore,
    /// The compositor handles the event itself, the drag crossed into a Wayland window.
    Take,
    /// Regular Wayland drag handling.
    Wayland,
}

pub(crate) fn atom_to_action(atoms: &Atoms, atom: Atom) -> DndAction {
    if atom == atoms.XdndActionCopy {
        DndAction::Copy
    } else if atom == atoms.XdndActionMove {
        DndAction::Move
    } else {
        // Ask needs a dialog nobody implements
        DndAction::None
    }
}

pub(crate) fn action_to_atom(atoms: &Atoms, action: DndAction) -> Atom {
    match action {
        DndAction::Copy => atoms.XdndActionCopy,
        DndAction::Move => atoms.XdndActionMove,
        DndAction::None | DndAction::Ask => NONE,
    }
}

/// Sends an XDND client message to `destination`.
pub(crate) fn send_message(
    ctx: &BridgeCtx<'_>,
    destination: Window,
    type_: Atom,
    data: [u32; 5],
) -> Result<(), XwlError> {
    trace!(destination, type_, ?data, "Sending XDND message.");
    let event = ClientMessageEvent::new(32, destination, type_, data);
    ctx.conn.send_client_message(destination, event)?;
    ctx.conn.flush()
}

#[derive(Debug)]
enum Drag {
    XToWl(XToWlDrag),
    WlToX(WlToXDrag),
}

impl Drag {
    fn handle_client_message(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
        event: &ClientMessageEvent,
    ) -> bool {
        match self {
            Drag::XToWl(drag) => drag.handle_client_message(ctx, handler, selection, event),
            Drag::WlToX(drag) => drag.handle_client_message(ctx, &*handler, event),
        }
    }

    fn handle_property_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
        id: RequestId,
        reply: &Option<GetPropertyReply>,
    ) -> bool {
        match self {
            Drag::XToWl(drag) => drag.handle_property_reply(ctx, handler, selection, id, reply),
            Drag::WlToX(drag) => drag.handle_property_reply(ctx, &*handler, id, reply),
        }
    }

    fn x_to_wl(&mut self, source: SourceId) -> Option<&mut XToWlDrag> {
        match self {
            Drag::XToWl(drag) if drag.source_id() == source => Some(drag),
            _ => None,
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Drag::XToWl(drag) => drag.is_finished(),
            Drag::WlToX(drag) => drag.is_finished(),
        }
    }

    fn destroy(self, ctx: &BridgeCtx<'_>, selection: &mut Selection) {
        match self {
            Drag::XToWl(drag) => drag.destroy(ctx, selection),
            // visits of X11 targets own no windows
            Drag::WlToX(_) => {}
        }
    }
}

/// The XdndSelection and every drag going through it.
#[derive(Debug)]
pub struct Dnd {
    selection: Selection,
    queue: SourceQueue,
    /// Published for an X11 drag, until the seat started the drag with it.
    pending_source: Option<Rc<XwlDataSource>>,
    current: Option<Drag>,
    old: Vec<Drag>,
}

impl Dnd {
    pub fn new(ctx: &BridgeCtx<'_>, queue: &SourceQueue) -> Result<Dnd, XwlError> {
        let selection = Selection::new(
            ctx,
            SelectionKind::Dnd,
            Size::from((8192, 8192)),
            WindowClass::INPUT_ONLY,
            EventMask::SUBSTRUCTURE_NOTIFY | EventMask::PROPERTY_CHANGE,
        )?;
        ctx.conn.change_property32(
            selection.window(),
            ctx.atoms.XdndAware,
            AtomEnum::ATOM.into(),
            &[ctx.config.xdnd_version()],
        )?;
        ctx.conn.flush()?;

        Ok(Dnd {
            selection,
            queue: queue.clone(),
            pending_source: None,
            current: None,
            old: Vec::new(),
        })
    }

    #[cfg(test)]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    #[cfg(test)]
    pub fn is_dragging(&self) -> bool {
        self.current.is_some()
    }

    /// Whether the X11 drag of `source` belongs to us.
    pub fn owns_source(&self, id: SourceId) -> bool {
        self.pending_source
            .as_ref()
            .is_some_and(|source| source.id() == id)
            || self
                .old
                .iter()
                .chain(self.current.as_ref())
                .any(|drag| matches!(drag, Drag::XToWl(drag) if drag.source_id() == id))
    }

    pub fn handle_x_event(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        event: &XEvent,
        now: Instant,
    ) -> bool {
        let handled = match event {
            XEvent::XfixesSelectionNotify(event) => {
                match self.selection.handle_xfixes_notify(event) {
                    OwnerChange::NotMine => false,
                    OwnerChange::Handled => true,
                    OwnerChange::Foreign(event) => {
                        self.foreign_owner(ctx, handler, &event);
                        true
                    }
                }
            }
            XEvent::SelectionRequest(request) => {
                self.selection.handle_selection_request(ctx, request, now)
            }
            XEvent::SelectionNotify(event) => self.selection.handle_selection_notify(ctx, event),
            XEvent::PropertyNotify(event) => {
                self.selection.handle_property_notify(ctx, event, now)
            }
            XEvent::PropertyReply { id, reply } => {
                self.selection.handle_property_reply(ctx, *id, reply, now)
                    || self
                        .old
                        .iter_mut()
                        .chain(self.current.as_mut())
                        .any(|drag| {
                            drag.handle_property_reply(
                                ctx,
                                handler,
                                &mut self.selection,
                                *id,
                                reply,
                            )
                        })
            }
            XEvent::ClientMessage(event) => self
                .old
                .iter_mut()
                .chain(self.current.as_mut())
                .any(|drag| drag.handle_client_message(ctx, handler, &mut self.selection, event)),
        };
        if handled {
            self.process_updates(ctx, None);
            self.collect(ctx);
        }
        handled
    }

    fn foreign_owner(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        event: &x11rb::protocol::xfixes::SelectionNotifyEvent,
    ) {
        match &self.current {
            Some(Drag::XToWl(_)) => {
                let Some(source) = self.selection.x11_source_mut() else {
                    return;
                };
                if source.owner() == event.owner {
                    source.set_timestamp(event.timestamp);
                } else {
                    // the new owner wins, the running drag finishes on its own
                    debug!(owner = event.owner, "XdndSelection taken over during X11 drag.");
                    source.mark_stale();
                }
            }
            Some(Drag::WlToX(_)) => {
                debug!(owner = event.owner, "Reclaiming XdndSelection for Wayland drag.");
                if let Err(err) = self.selection.own_selection(ctx, true) {
                    warn!(?err, "Failed to reclaim XdndSelection.");
                }
            }
            None => {
                self.selection.create_x11_source(None);
                if !handler.pointer_focus_is_xwayland() || !handler.is_left_button_pressed() {
                    // not a drag by the user, maybe some client misbehaving
                    trace!(owner = event.owner, "Ignoring XdndSelection without a pointer grab.");
                    return;
                }
                self.selection.create_x11_source(Some(event));
                let source = XwlDataSource::new(&self.queue, Vec::new());
                debug!(owner = event.owner, source = ?source.id(), "X11 client started a drag.");
                self.pending_source = Some(source.clone());
                handler.start_drag(source);
            }
        }
    }

    /// The seat started a drag.
    pub fn drag_started(&mut self, ctx: &BridgeCtx<'_>, handler: &mut dyn BridgeHandler) {
        let Some(source) = handler.drag_source() else {
            return;
        };
        if let Some(current) = self.current.take() {
            warn!("Drag started while another one is running.");
            self.retire(ctx, current);
        }

        if let Some(ours) = self.pending_source.take() {
            if ours.is(&source) {
                self.current = Some(Drag::XToWl(XToWlDrag::new(ours)));
                return;
            }
        }

        debug!("Wayland client started a drag.");
        if let Err(err) = prefetch_mime_atoms(ctx.conn, &source.mime_types()) {
            warn!(?err, "Failed to look up drag targets.");
        }
        self.selection.set_wl_source(Some(WlSource::new(&source)));
        if let Err(err) = self.selection.own_selection(ctx, true) {
            warn!(?err, "Failed to claim XdndSelection.");
        }
        self.current = Some(Drag::WlToX(WlToXDrag::new(self.selection.window())));
    }

    /// The seat drag is over, the drag lingers until its transfers are done.
    pub fn drag_ended(&mut self, ctx: &BridgeCtx<'_>) {
        if let Some(current) = self.current.take() {
            self.retire(ctx, current);
        }
        self.collect(ctx);
    }

    fn retire(&mut self, ctx: &BridgeCtx<'_>, mut drag: Drag) {
        if let Drag::WlToX(drag) = &mut drag {
            drag.end(ctx);
        }
        if drag.is_finished() {
            drag.destroy(ctx, &mut self.selection);
        } else {
            self.old.push(drag);
        }
    }

    pub fn drag_move_filter(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        target: Option<WindowId>,
    ) -> DragEventReply {
        match &mut self.current {
            Some(Drag::XToWl(drag)) => drag.move_filter(ctx, handler, &mut self.selection, target),
            Some(Drag::WlToX(drag)) => drag.move_filter(ctx, &*handler),
            None => DragEventReply::Wayland,
        }
    }

    /// The seat's drag focus changed, only relevant for X11 drop targets.
    pub fn update_drag_target(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        target: Option<WindowId>,
        serial: Serial,
    ) {
        if let Some(Drag::WlToX(drag)) = &mut self.current {
            drag.update_drag_target(ctx, handler, target, serial);
        }
    }

    pub fn drop(&mut self, ctx: &BridgeCtx<'_>) {
        if let Some(Drag::WlToX(drag)) = &mut self.current {
            drag.drop(ctx);
        }
    }

    /// Reacts to the seat using one of our drag sources.
    pub fn handle_source_event(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: SourceEvent,
        now: Instant,
    ) -> bool {
        match event {
            SourceEvent::DataRequested {
                source,
                mime_type,
                fd,
            } => {
                if !self.owns_source(source) {
                    return false;
                }
                self.start_transfer(ctx, source, &mime_type, fd, now);
            }
            SourceEvent::Dropped(source) => {
                let Some(drag) = self.x_to_wl(source) else {
                    return false;
                };
                drag.dropped(ctx, now);
            }
            SourceEvent::Finished(source) => {
                let Some(drag) = self.x_to_wl(source) else {
                    return false;
                };
                drag.dnd_finished(ctx);
            }
            SourceEvent::Cancelled(source) => {
                if self
                    .pending_source
                    .as_ref()
                    .is_some_and(|pending| pending.id() == source)
                {
                    self.pending_source = None;
                    return true;
                }
                let Some(drag) = self.x_to_wl(source) else {
                    return false;
                };
                drag.cancelled(ctx, now);
            }
            SourceEvent::Destroyed(source) => return self.owns_source(source),
        }
        self.collect(ctx);
        true
    }

    fn x_to_wl(&mut self, source: SourceId) -> Option<&mut XToWlDrag> {
        self.old
            .iter_mut()
            .chain(self.current.as_mut())
            .find_map(|drag| drag.x_to_wl(source))
    }

    fn start_transfer(
        &mut self,
        ctx: &BridgeCtx<'_>,
        source: SourceId,
        mime_type: &str,
        fd: OwnedFd,
        now: Instant,
    ) {
        self.selection.start_transfer_to_wayland(ctx, mime_type, fd, now);
        self.process_updates(ctx, Some(source));
    }

    fn process_updates(&mut self, ctx: &BridgeCtx<'_>, requested_by: Option<SourceId>) {
        for update in self.selection.take_updates() {
            match update {
                SelectionUpdate::TransferStarted(timestamp) => {
                    let drag = requested_by.and_then(|source| self.x_to_wl(source));
                    if let Some(drag) = drag {
                        drag.transfer_started(timestamp);
                    }
                }
                SelectionUpdate::TransferFinished(timestamp) => {
                    for drag in self.old.iter_mut().chain(self.current.as_mut()) {
                        if let Drag::XToWl(drag) = drag {
                            if drag.transfer_finished(ctx, timestamp) {
                                break;
                            }
                        }
                    }
                }
                // offers of X11 drags come with the XDND messages
                SelectionUpdate::OffersChanged => {}
            }
        }
    }

    pub fn refresh(&mut self, ctx: &BridgeCtx<'_>, now: Instant) {
        self.selection.refresh(ctx, now);
        self.process_updates(ctx, None);
        for drag in self.old.iter_mut().chain(self.current.as_mut()) {
            if let Drag::XToWl(drag) = drag {
                drag.refresh(ctx, now);
            }
        }
        self.collect(ctx);
    }

    /// Destroys finished drags that already ended.
    fn collect(&mut self, ctx: &BridgeCtx<'_>) {
        let (finished, running) = std::mem::take(&mut self.old)
            .into_iter()
            .partition::<Vec<_>, _>(Drag::is_finished);
        self.old = running;
        for drag in finished {
            trace!("Old drag finished.");
            drag.destroy(ctx, &mut self.selection);
        }

        if self.current.is_none() && self.old.is_empty() {
            if self.selection.wl_source().is_some() {
                self.selection.set_wl_source(None);
                if let Err(err) = self.selection.own_selection(ctx, false) {
                    warn!(?err, "Failed to release XdndSelection.");
                }
            }
            self.selection.overwrite_requestor(None);
        }
    }

    /// Forgets every drag without further X11 traffic.
    pub fn clear(&mut self) {
        self.pending_source = None;
        self.current = None;
        self.old.clear();
        self.selection.overwrite_requestor(None);
        self.selection.clear();
    }

    pub fn destroy(mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        for drag in self.old.drain(..).chain(self.current.take()) {
            drag.destroy(ctx, &mut self.selection);
        }
        self.selection.destroy(ctx)
    }
}
