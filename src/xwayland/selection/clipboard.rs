// SPDX-License-Identifier: GPL-3.0-only

use std::{os::fd::OwnedFd, rc::Rc, time::Instant};

use smithay::utils::Size;
use tracing::{debug, trace, warn};
use x11rb::{
    protocol::xproto::{EventMask, WindowClass},
    NONE,
};

use super::{send_selection_notify, OwnerChange, Selection, SelectionKind, SelectionUpdate};
use crate::xwayland::{
    atoms::prefetch_mime_atoms,
    conn::{XEvent, XwlError},
    data_source::{DataSource, SourceId, SourceQueue, XwlDataSource},
    sources::WlSource,
    BridgeCtx, BridgeHandler, SelectionTarget,
};

/// CLIPBOARD or PRIMARY, bridged in both directions.
///
/// X11 clients only get to see a Wayland selection while an X11 window is
/// active, unless focus gating is disabled.
#[derive(Debug)]
pub struct Clipboard {
    target: SelectionTarget,
    selection: Selection,
    queue: SourceQueue,
    data_source: Option<Rc<XwlDataSource>>,
    waiting_for_targets: bool,
}

impl Clipboard {
    pub fn new(
        ctx: &BridgeCtx<'_>,
        target: SelectionTarget,
        queue: &SourceQueue,
    ) -> Result<Clipboard, XwlError> {
        let kind = match target {
            SelectionTarget::Clipboard => SelectionKind::Clipboard,
            SelectionTarget::Primary => SelectionKind::Primary,
        };
        let selection = Selection::new(
            ctx,
            kind,
            Size::from((10, 10)),
            WindowClass::INPUT_OUTPUT,
            EventMask::SUBSTRUCTURE_NOTIFY | EventMask::PROPERTY_CHANGE,
        )?;

        Ok(Clipboard {
            target,
            selection,
            queue: queue.clone(),
            data_source: None,
            waiting_for_targets: false,
        })
    }

    #[cfg(test)]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    fn x11_clients_can_access(ctx: &BridgeCtx<'_>, handler: &dyn BridgeHandler) -> bool {
        !ctx.config.focus_gated_selection || handler.active_window_is_x11()
    }

    /// Whether `source` is the data source we published for the X11 owner.
    fn owns_selection(&self, source: Option<&Rc<dyn DataSource>>) -> bool {
        match (source, &self.data_source) {
            (Some(source), Some(ours)) => ours.is(source),
            _ => false,
        }
    }

    pub fn owns_source(&self, id: SourceId) -> bool {
        self.data_source
            .as_ref()
            .is_some_and(|source| source.id() == id)
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
                        self.selection.create_x11_source(None);
                        self.unpublish(handler);
                        if event.owner == NONE {
                            return true;
                        }
                        if !handler.active_window_is_x11() {
                            // the owner is published once an X11 window gets focus
                            trace!(
                                target = ?self.target,
                                "Ignoring X11 selection without X11 focus."
                            );
                            return true;
                        }
                        self.selection.create_x11_source(Some(&event));
                        if let Some(source) = self.selection.x11_source_mut() {
                            match source.get_targets(ctx) {
                                Ok(()) => self.waiting_for_targets = true,
                                Err(err) => warn!(?err, "Failed to request selection targets."),
                            }
                        }
                        true
                    }
                }
            }
            XEvent::SelectionRequest(request) => {
                if request.selection == self.selection.atom()
                    && !Self::x11_clients_can_access(ctx, handler)
                {
                    debug!(
                        target = ?self.target,
                        requestor = request.requestor,
                        "Refusing selection request without X11 focus."
                    );
                    if let Err(err) = send_selection_notify(ctx.conn, request, false) {
                        warn!(?err, "Failed to refuse selection request.");
                    }
                    true
                } else {
                    self.selection.handle_selection_request(ctx, request, now)
                }
            }
            XEvent::SelectionNotify(event) => self.selection.handle_selection_notify(ctx, event),
            XEvent::PropertyNotify(event) => {
                self.selection.handle_property_notify(ctx, event, now)
            }
            XEvent::PropertyReply { id, reply } => {
                self.selection.handle_property_reply(ctx, *id, reply, now)
            }
            XEvent::ClientMessage(_) => false,
        };
        if handled {
            self.process_updates(handler);
        }
        handled
    }

    fn process_updates(&mut self, handler: &mut dyn BridgeHandler) {
        for update in self.selection.take_updates() {
            if update == SelectionUpdate::OffersChanged {
                self.x11_offers_changed(handler);
            }
        }
    }

    /// Takes our wrapper of the previous X11 owner off the seat.
    fn unpublish(&mut self, handler: &mut dyn BridgeHandler) {
        if self.owns_selection(handler.selection(self.target).as_ref()) {
            debug!(target = ?self.target, "X11 selection owner went away.");
            handler.set_selection(self.target, None);
        }
        self.data_source = None;
    }

        fn x11_offers_changed(&mut self, handler: &mut dyn BridgeHandler) {
        self.waiting_for_targets = false;
        let Some(source) = self.selection.x11_source() else {
            warn!(target = ?self.target, "Offers changed without an X11 source.");
            return;
        };

        let mime_types = source.mime_types();
        if !mime_types.is_empty() {
            debug!(target = ?self.target, ?mime_types, "Publishing X11 selection.");
            let data_source = XwlDataSource::new(&self.queue, mime_types);
            // the previous source has to stay alive until the seat switched over
            let _previous = self.data_source.replace(data_source.clone());
            handler.set_selection(self.target, Some(data_source));
        } else if !self.owns_selection(handler.selection(self.target).as_ref()) {
            handler.set_selection(self.target, None);
            self.data_source = None;
        }
    }

    /// The seat selection changed.
    pub fn wl_selection_changed(&mut self, ctx: &BridgeCtx<'_>, handler: &mut dyn BridgeHandler) {
        if self.waiting_for_targets {
            return;
        }
        let current = handler.selection(self.target);
        if !self.owns_selection(current.as_ref()) {
            // a Wayland client provides a new selection, replace the old wrapper
            self.selection.set_wl_source(None);
        }
        self.check_wl_source(ctx, handler);
    }

    /// Claims or releases the X11 selection for the current seat selection.
    pub fn check_wl_source(&mut self, ctx: &BridgeCtx<'_>, handler: &mut dyn BridgeHandler) {
        let current = handler.selection(self.target);

        let remove = match &current {
            None => true,
            Some(source) => {
                self.owns_selection(Some(source)) || !Self::x11_clients_can_access(ctx, handler)
            }
        };
        if remove {
            if self.selection.wl_source().is_some() {
                self.selection.set_wl_source(None);
                if let Err(err) = self.selection.own_selection(ctx, false) {
                    warn!(?err, target = ?self.target, "Failed to release selection.");
                }
            }
            return;
        }

        if self
            .selection
            .wl_source()
            .is_some_and(|source| current.as_ref().is_some_and(|current| source.is_source(current)))
        {
            return;
        }
        let Some(current) = current else {
            return;
        };
        debug!(target = ?self.target, "Offering Wayland selection to X11 clients.");
        if let Err(err) = prefetch_mime_atoms(ctx.conn, &current.mime_types()) {
            warn!(?err, "Failed to look up selection targets.");
        }
        self.selection.set_wl_source(Some(WlSource::new(&current)));
        if let Err(err) = self.selection.own_selection(ctx, true) {
            warn!(?err, target = ?self.target, "Failed to claim selection.");
        }
    }

    /// A Wayland client wants the content of the X11 selection.
    pub fn start_transfer(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        mime_type: &str,
        fd: OwnedFd,
        now: Instant,
    ) {
        self.selection.start_transfer_to_wayland(ctx, mime_type, fd, now);
        self.process_updates(handler);
    }

    pub fn refresh(&mut self, ctx: &BridgeCtx<'_>, handler: &mut dyn BridgeHandler, now: Instant) {
        self.selection.refresh(ctx, now);
        self.process_updates(handler);
    }

    /// Forgets everything, un-publishing our data source from the seat.
    pub fn clear(&mut self, handler: &mut dyn BridgeHandler) {
        if self.owns_selection(handler.selection(self.target).as_ref()) {
            handler.set_selection(self.target, None);
        }
        self.data_source = None;
        self.waiting_for_targets = false;
        self.selection.clear();
    }

    pub fn destroy(self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        self.selection.destroy(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xwayland::{
        conn::XEvent,
        data_source::SourceEvent,
        testing::{
            selection_request, targets_reply, xfixes_notify, Harness, MockHandler, Request,
            TestSource,
        },
    };
    use x11rb::{
        protocol::xproto::{SelectionNotifyEvent, SELECTION_NOTIFY_EVENT},
        NONE,
    };

    fn clipboard(harness: &Harness) -> Clipboard {
        Clipboard::new(&harness.ctx(), SelectionTarget::Clipboard, &harness.queue).unwrap()
    }

    /// Runs the X11 owner `0x99` through the TARGETS round trip.
    fn claim_from_x11(
        harness: &Harness,
        clipboard: &mut Clipboard,
        handler: &mut MockHandler,
        targets: &[u32],
    ) {
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let window = clipboard.selection().window();
        let now = Instant::now();

        let notify = xfixes_notify(window, 0x99, atoms.CLIPBOARD, 10);
        let event = XEvent::XfixesSelectionNotify(notify);
        assert!(clipboard.handle_x_event(&ctx, handler, &event, now));
        let event = XEvent::SelectionNotify(SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: 10,
            requestor: window,
            selection: atoms.CLIPBOARD,
            target: atoms.TARGETS,
            property: atoms.WL_SELECTION,
        });
        assert!(clipboard.handle_x_event(&ctx, handler, &event, now));
        let id = harness.conn.last_property_request().unwrap().id;
        let reply = XEvent::PropertyReply {
            id,
            reply: Some(targets_reply(targets)),
        };
        assert!(clipboard.handle_x_event(&ctx, handler, &reply, now));
    }

    #[test]
    fn x11_selection_is_published() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);
        let text_plain = harness.conn.intern("text/plain");

        let targets = [harness.atoms.TARGETS, text_plain];
        claim_from_x11(&harness, &mut clipboard, &mut handler, &targets);

        let published = handler.selection(SelectionTarget::Clipboard).unwrap();
        assert_eq!(published.mime_types(), vec!["text/plain"]);
        assert!(clipboard.owns_selection(Some(&published)));

        // the seat reporting our own source back changes nothing
        harness.conn.take_requests();
        clipboard.wl_selection_changed(&harness.ctx(), &mut handler);
        assert!(harness.conn.take_requests().is_empty());
        assert!(clipboard.selection().x11_source().is_some());
    }

    #[test]
    fn x11_selection_without_focus_is_ignored() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        let mut clipboard = clipboard(&harness);
        let window = clipboard.selection().window();
        harness.conn.take_requests();

        let notify = xfixes_notify(window, 0x99, harness.atoms.CLIPBOARD, 10);
        assert!(clipboard.handle_x_event(
            &harness.ctx(),
            &mut handler,
            &XEvent::XfixesSelectionNotify(notify),
            Instant::now()
        ));
        assert!(clipboard.selection().x11_source().is_none());
        assert!(harness.conn.take_requests().is_empty());
    }

    #[test]
    fn lost_x11_owner_leaves_the_seat() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);
        let window = clipboard.selection().window();
        let text_plain = harness.conn.intern("text/plain");

        let targets = [harness.atoms.TARGETS, text_plain];
        claim_from_x11(&harness, &mut clipboard, &mut handler, &targets);
        assert!(handler.selection(SelectionTarget::Clipboard).is_some());

        let notify = xfixes_notify(window, NONE, harness.atoms.CLIPBOARD, 11);
        assert!(clipboard.handle_x_event(
            &harness.ctx(),
            &mut handler,
            &XEvent::XfixesSelectionNotify(notify),
            Instant::now()
        ));
        assert!(handler.selection(SelectionTarget::Clipboard).is_none());
        assert!(clipboard.selection().x11_source().is_none());
    }

    #[test]
    fn foreign_owner_without_focus_leaves_the_seat() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);
        let window = clipboard.selection().window();
        let text_plain = harness.conn.intern("text/plain");

        let targets = [harness.atoms.TARGETS, text_plain];
        claim_from_x11(&harness, &mut clipboard, &mut handler, &targets);
        handler.active_x11 = false;
        let notify = xfixes_notify(window, 0x9a, harness.atoms.CLIPBOARD, 12);
        assert!(clipboard.handle_x_event(
            &harness.ctx(),
            &mut handler,
            &XEvent::XfixesSelectionNotify(notify),
            Instant::now()
        ));
        assert!(handler.selection(SelectionTarget::Clipboard).is_none());
    }

    #[test]
    fn empty_offers_clear_the_seat() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);
        let text_plain = harness.conn.intern("text/plain");

        claim_from_x11(&harness, &mut clipboard, &mut handler, &[text_plain]);
        assert!(handler.selection(SelectionTarget::Clipboard).is_some());
        claim_from_x11(&harness, &mut clipboard, &mut handler, &[harness.atoms.TARGETS]);
        assert!(handler.selection(SelectionTarget::Clipboard).is_none());

        let wayland: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        handler.set_selection(SelectionTarget::Clipboard, Some(wayland));
        handler.active_x11 = false;
        clipboard.wl_selection_changed(&harness.ctx(), &mut handler);
        handler.active_x11 = true;
        claim_from_x11(&harness, &mut clipboard, &mut handler, &[]);
        assert!(handler.selection(SelectionTarget::Clipboard).is_none());
    }

    #[test]
    fn wayland_selection_follows_focus() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let mut handler = MockHandler::default();
        let mut clipboard = clipboard(&harness);
        let window = clipboard.selection().window();
        harness.conn.take_requests();

        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        handler.set_selection(SelectionTarget::Clipboard, Some(source.clone()));
        clipboard.wl_selection_changed(&ctx, &mut handler);
        // no X11 window is active
        assert!(clipboard.selection().wl_source().is_none());
        assert!(harness.conn.take_requests().is_empty());

        handler.active_x11 = true;
        clipboard.check_wl_source(&ctx, &mut handler);
        assert!(clipboard.selection().wl_source().unwrap().is_source(&source));
        assert_eq!(
            harness.conn.take_requests(),
            vec![Request::SetSelectionOwner {
                owner: window,
                selection: atoms.CLIPBOARD,
                time: x11rb::CURRENT_TIME,
            }]
        );

        // already claimed
        clipboard.check_wl_source(&ctx, &mut handler);
        assert!(harness.conn.take_requests().is_empty());

        handler.active_x11 = false;
        clipboard.check_wl_source(&ctx, &mut handler);
        assert!(clipboard.selection().wl_source().is_none());
        assert!(matches!(
            harness.conn.take_requests().as_slice(),
            [Request::SetSelectionOwner { owner: NONE, .. }]
        ));
    }

    #[test]
    fn offered_targets_are_interned_ahead() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);

        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain", "image/png"]);
        handler.set_selection(SelectionTarget::Clipboard, Some(source));
        clipboard.wl_selection_changed(&harness.ctx(), &mut handler);
        assert!(clipboard.selection().wl_source().is_some());
        assert_eq!(harness.conn.take_prefetched(), vec!["image/png"]);
    }

    #[test]
    fn requests_without_focus_are_refused() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);
        let window = clipboard.selection().window();

        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        handler.set_selection(SelectionTarget::Clipboard, Some(source));
        clipboard.wl_selection_changed(&ctx, &mut handler);
        harness.conn.take_requests();

        let request = XEvent::SelectionRequest(selection_request(
            window,
            0x20,
            atoms.CLIPBOARD,
            atoms.TARGETS,
            0x30,
        ));
        handler.active_x11 = false;
        assert!(clipboard.handle_x_event(&ctx, &mut handler, &request, Instant::now()));
        assert!(matches!(
            harness.conn.take_requests().as_slice(),
            [Request::SelectionNotify(notify)] if notify.property == NONE
        ));

        handler.active_x11 = true;
        assert!(clipboard.handle_x_event(&ctx, &mut handler, &request, Instant::now()));
        assert!(matches!(
            harness.conn.take_requests().as_slice(),
            [Request::ChangeProperty32 { .. }, Request::SelectionNotify(notify)]
                if notify.property == 0x30
        ));
    }

    #[test]
    fn ungated_requests_are_answered() {
        let mut harness = Harness::new();
        harness.config.focus_gated_selection = false;
        let ctx = harness.ctx();
        let mut handler = MockHandler::default();
        let mut clipboard = clipboard(&harness);

        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        handler.set_selection(SelectionTarget::Clipboard, Some(source));
        clipboard.wl_selection_changed(&ctx, &mut handler);
        assert!(clipboard.selection().wl_source().is_some());
    }

    #[test]
    fn data_requests_start_transfers() {
        let harness = Harness::new();
        let mut handler = MockHandler::default();
        handler.active_x11 = true;
        let mut clipboard = clipboard(&harness);
        let text_plain = harness.conn.intern("text/plain");
        claim_from_x11(&harness, &mut clipboard, &mut handler, &[text_plain]);

        let published = handler.selection(SelectionTarget::Clipboard).unwrap();
        let (_read, write) = rustix::pipe::pipe().unwrap();
        published.request_data("text/plain", write);

        let event = harness.queue.borrow_mut().pop_front().unwrap();
        let SourceEvent::DataRequested {
            source,
            mime_type,
            fd,
        } = event
        else {
            panic!("unexpected source event");
        };
        assert!(clipboard.owns_source(source));
        harness.conn.take_requests();
        clipboard.start_transfer(&harness.ctx(), &mut handler, &mime_type, fd, Instant::now());
        assert!(matches!(
            harness.conn.take_requests().as_slice(),
            [Request::CreateWindow { .. }, Request::ConvertSelection { target, .. }]
                if *target == text_plain
        ));
    }
}
