// SPDX-License-Identifier: GPL-3.0-only

use std::{os::fd::OwnedFd, time::Instant};

use smithay::utils::{Logical, Point, Size};
use tracing::{debug, trace, warn};
use x11rb::{
    protocol::{
        xfixes,
        xproto::{
            Atom, EventMask, GetPropertyReply, PropertyNotifyEvent, SelectionNotifyEvent,
            SelectionRequestEvent, Timestamp, Window, WindowClass, SELECTION_NOTIFY_EVENT,
        },
    },
    CURRENT_TIME, NONE,
};

use super::{
    conn::{RequestId, XConnection, XwlError},
    sources::{RequestOutcome, WlSource, X11Source},
    transfer::{TransferWlToX, TransferXToWl},
    BridgeCtx,
};

mod clipboard;
pub use self::clipboard::Clipboard;

/// Which X11 selection a [`Selection`] bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    Clipboard,
    Primary,
    Dnd,
}

impl SelectionKind {
    pub fn atom(&self, ctx: &BridgeCtx<'_>) -> Atom {
        match self {
            SelectionKind::Clipboard => ctx.atoms.CLIPBOARD,
            SelectionKind::Primary => ctx.atoms.PRIMARY,
            SelectionKind::Dnd => ctx.atoms.XdndSelection,
        }
    }
}

#[derive(Debug)]
pub enum Source {
    Wayland(WlSource),
    X11(X11Source),
}

/// Result of an XFixes ownership notification.
#[derive(Debug)]
pub enum OwnerChange {
    NotMine,
    Handled,
    /// Some other client claimed the selection.
    Foreign(xfixes::SelectionNotifyEvent),
}

/// Happenings the selection specializations react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionUpdate {
    /// The targets of the X11 owner were (re-)read.
    OffersChanged,
    TransferStarted(Timestamp),
    TransferFinished(Timestamp),
}

pub fn send_selection_notify(
    conn: &dyn XConnection,
    request: &SelectionRequestEvent,
    success: bool,
) -> Result<(), XwlError> {
    conn.send_selection_notify(SelectionNotifyEvent {
        response_type: SELECTION_NOTIFY_EVENT,
        sequence: 0,
        time: request.time,
        requestor: request.requestor,
        selection: request.selection,
        target: request.target,
        property: if success { request.property } else { NONE },
    })?;
    conn.flush()
}

/// Ownership bookkeeping and data transfers of one X11 selection.
#[derive(Debug)]
pub struct Selection {
    atom: Atom,
    window: Window,
    requestor: Window,
    timestamp: Timestamp,
    source: Option<Source>,
    disown_pending: bool,
    wl_to_x: Vec<TransferWlToX>,
    x_to_wl: Vec<TransferXToWl>,
    updates: Vec<SelectionUpdate>,
}

impl Selection {
    /// Creates the proxy window owning the selection on our behalf.
    pub fn new(
        ctx: &BridgeCtx<'_>,
        kind: SelectionKind,
        size: Size<i32, Logical>,
        class: WindowClass,
        event_mask: EventMask,
    ) -> Result<Selection, XwlError> {
        let atom = kind.atom(ctx);
        let window = ctx.conn.create_window(
            ctx.conn.root(),
            Point::from((0, 0)),
            size,
            class,
            event_mask,
        )?;
        ctx.conn.select_selection_events(window, atom)?;
        ctx.conn.flush()?;

        Ok(Selection {
            atom,
            window,
            requestor: window,
            timestamp: CURRENT_TIME,
            source: None,
            disown_pending: false,
            wl_to_x: Vec::new(),
            x_to_wl: Vec::new(),
            updates: Vec::new(),
        })
    }

    pub fn atom(&self) -> Atom {
        self.atom
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn requestor(&self) -> Window {
        self.requestor
    }

    pub fn wl_source(&self) -> Option<&WlSource> {
        match &self.source {
            Some(Source::Wayland(source)) => Some(source),
            _ => None,
        }
    }

    pub fn x11_source(&self) -> Option<&X11Source> {
        match &self.source {
            Some(Source::X11(source)) => Some(source),
            _ => None,
        }
    }

    pub fn x11_source_mut(&mut self) -> Option<&mut X11Source> {
        match &mut self.source {
            Some(Source::X11(source)) => Some(source),
            _ => None,
        }
    }

    pub fn set_wl_source(&mut self, source: Option<WlSource>) {
        self.source = source.map(Source::Wayland);
    }

    /// Replaces any current source with one for the owner in `event`.
    pub fn create_x11_source(&mut self, event: Option<&xfixes::SelectionNotifyEvent>) {
        self.source = event
            .filter(|event| event.owner != NONE)
            .map(|event| Source::X11(X11Source::new(self.atom, event)));
    }

    pub fn own_selection(&mut self, ctx: &BridgeCtx<'_>, own: bool) -> Result<(), XwlError> {
        if own {
            ctx.conn
                .set_selection_owner(self.window, self.atom, CURRENT_TIME)?;
        } else {
            self.disown_pending = true;
            ctx.conn.set_selection_owner(NONE, self.atom, self.timestamp)?;
        }
        ctx.conn.flush()
    }

    /// Uses `window` instead of our own window to request data from X11 owners.
    pub fn overwrite_requestor(&mut self, window: Option<Window>) {
        self.requestor = window.unwrap_or(self.window);
    }

    pub fn take_updates(&mut self) -> Vec<SelectionUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn handle_xfixes_notify(&mut self, event: &xfixes::SelectionNotifyEvent) -> OwnerChange {
        if event.window != self.window || event.selection != self.atom {
            return OwnerChange::NotMine;
        }
        if self.disown_pending {
            // our own disown
            self.disown_pending = false;
            return OwnerChange::Handled;
        }
        if event.owner == self.window {
            // we claim with CURRENT_TIME, TIMESTAMP requests need the real one
            self.timestamp = event.timestamp;
            if let Some(Source::Wayland(source)) = &mut self.source {
                source.set_timestamp(event.timestamp);
            }
            return OwnerChange::Handled;
        }
        trace!(
            selection = self.atom,
            owner = event.owner,
            "Selection claimed by X11 client."
        );
        OwnerChange::Foreign(*event)
    }

    pub fn handle_selection_request(
        &mut self,
        ctx: &BridgeCtx<'_>,
        request: &SelectionRequestEvent,
        now: Instant,
    ) -> bool {
        if request.selection != self.atom {
            return false;
        }
        let mut request = *request;
        if request.property == NONE {
            // obsolete clients, see ICCCM 2.2
            request.property = request.target;
        }

        let source = match &self.source {
            Some(Source::Wayland(source)) if request.owner == self.window => source,
            _ => {
                if request.time != CURRENT_TIME && request.time < self.timestamp {
                    // cancel earlier attempts at receiving the selection
                    if let Err(err) = send_selection_notify(ctx.conn, &request, false) {
                        warn!(?err, "Failed to refuse selection request.");
                    }
                    return true;
                }
                return false;
            }
        };

        match source.handle_selection_request(ctx, &request) {
            Ok(RequestOutcome::Replied) => {}
            Ok(RequestOutcome::Transfer(fd)) => self.start_transfer_to_x(ctx, request, fd, now),
            Err(err) => {
                warn!(?err, "Failed to answer selection request.");
                if let Err(err) = send_selection_notify(ctx.conn, &request, false) {
                    warn!(?err, "Failed to refuse selection request.");
                }
            }
        }
        true
    }

    fn start_transfer_to_x(
        &mut self,
        ctx: &BridgeCtx<'_>,
        request: SelectionRequestEvent,
        fd: OwnedFd,
        now: Instant,
    ) {
        debug!(
            requestor = request.requestor,
            target = request.target,
            "Starting Wayland to X11 transfer."
        );
        let mut transfer = TransferWlToX::new(ctx, request, fd, now);
        if let Err(err) = transfer.refresh(ctx, now) {
            warn!(?err, "Wayland to X11 transfer failed.");
        }
        self.wl_to_x.push(transfer);
    }

    /// Starts moving the X11 selection content for `mime_type` into `fd`.
    pub fn start_transfer_to_wayland(
        &mut self,
        ctx: &BridgeCtx<'_>,
        mime_type: &str,
        fd: OwnedFd,
        now: Instant,
    ) -> bool {
        let Some(source) = self.x11_source() else {
            debug!(mime_type, "No X11 selection to transfer from.");
            return false;
        };
        let Some(target) = source.target_for(mime_type) else {
            debug!(mime_type, "Sending X11 selection to Wayland failed: unsupported mime type.");
            return false;
        };
        let timestamp = source.timestamp();

        match TransferXToWl::new(ctx, self.atom, target, fd, timestamp, self.requestor, now) {
            Ok(transfer) => {
                debug!(mime_type, "Starting X11 to Wayland transfer.");
                self.x_to_wl.push(transfer);
                self.updates.push(SelectionUpdate::TransferStarted(timestamp));
                true
            }
            Err(err) => {
                warn!(?err, "Failed to start X11 to Wayland transfer.");
                false
            }
        }
    }

    pub fn handle_selection_notify(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &SelectionNotifyEvent,
    ) -> bool {
        if let Some(source) = self.x11_source_mut() {
            match source.handle_selection_notify(ctx, event) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, "Failed to read selection targets.");
                    return true;
                }
            }
        }
        for transfer in &mut self.x_to_wl {
            match transfer.handle_selection_notify(ctx, event) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, "Failed to read selection data.");
                    transfer.end();
                    return true;
                }
            }
        }
        false
    }

    pub fn handle_property_notify(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &PropertyNotifyEvent,
        now: Instant,
    ) -> bool {
        for transfer in &mut self.x_to_wl {
            match transfer.handle_property_notify(ctx, event) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, "Failed to read INCR chunk.");
                    transfer.end();
                    return true;
                }
            }
        }
        for transfer in &mut self.wl_to_x {
            match transfer.handle_property_notify(ctx, event, now) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, "Failed to write INCR chunk.");
                    return true;
                }
            }
        }
        false
    }

    pub fn handle_property_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        id: RequestId,
        reply: &Option<GetPropertyReply>,
        now: Instant,
    ) -> bool {
        if let Some(source) = self.x11_source_mut() {
            if source.owns_request(id) {
                match source.handle_targets_reply(ctx, reply.clone()) {
                    Ok(true) => self.updates.push(SelectionUpdate::OffersChanged),
                    Ok(false) => {}
                    Err(err) => warn!(?err, "Failed to convert selection targets."),
                }
                return true;
            }
        }
        if let Some(transfer) = self
            .x_to_wl
            .iter_mut()
            .find(|transfer| transfer.owns_request(id))
        {
            if let Err(err) = transfer.handle_property_reply(ctx, reply.clone(), now) {
                warn!(?err, "X11 to Wayland transfer failed.");
                transfer.end();
            }
            return true;
        }
        false
    }

    /// Drives pending pipe I/O and ends idle transfers.
    pub fn refresh(&mut self, ctx: &BridgeCtx<'_>, now: Instant) {
        let timeout = ctx.config.transfer_timeout();
        for transfer in &mut self.wl_to_x {
            if let Err(err) = transfer.refresh(ctx, now) {
                warn!(?err, "Wayland to X11 transfer failed.");
            }
            if !transfer.is_finished() && transfer.is_timed_out(now, timeout) {
                warn!(timestamp = transfer.timestamp(), "Wayland to X11 transfer timed out.");
                if let Err(err) = transfer.end(ctx) {
                    warn!(?err, "Failed to end transfer.");
                }
            }
        }
        for transfer in &mut self.x_to_wl {
            if let Err(err) = transfer.refresh(ctx, now) {
                warn!(?err, "X11 to Wayland transfer failed.");
            }
            if !transfer.is_finished() && transfer.is_timed_out(now, timeout) {
                warn!(timestamp = transfer.timestamp(), "X11 to Wayland transfer timed out.");
                transfer.end();
            }
        }
        self.collect_transfers(ctx);
    }

    /// Removes finished transfers and reports them.
    pub fn collect_transfers(&mut self, ctx: &BridgeCtx<'_>) {
        let updates = &mut self.updates;
        self.wl_to_x.retain(|transfer| {
            if transfer.is_finished() {
                updates.push(SelectionUpdate::TransferFinished(transfer.timestamp()));
                false
            } else {
                true
            }
        });

        let (finished, running) = std::mem::take(&mut self.x_to_wl)
            .into_iter()
            .partition::<Vec<_>, _>(|transfer| transfer.is_finished());
        self.x_to_wl = running;
        for transfer in finished {
            self.updates
                .push(SelectionUpdate::TransferFinished(transfer.timestamp()));
            if let Err(err) = transfer.destroy(ctx) {
                warn!(?err, "Failed to destroy transfer window.");
            }
        }
    }

    #[cfg(test)]
    pub fn has_transfers(&self) -> bool {
        !self.wl_to_x.is_empty() || !self.x_to_wl.is_empty()
    }

    /// Drops sources and transfers without further X11 traffic.
    pub fn clear(&mut self) {
        self.source = None;
        self.wl_to_x.clear();
        self.x_to_wl.clear();
        self.updates.clear();
    }

    pub fn destroy(mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        for transfer in self.x_to_wl.drain(..) {
            transfer.destroy(ctx)?;
        }
        ctx.conn.destroy_window(self.window)?;
        ctx.conn.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xwayland::{
        data_source::DataSource,
        testing::{selection_request, targets_reply, xfixes_notify, Harness, Request, TestSource},
    };
    use std::rc::Rc;
    use x11rb::protocol::xproto::SelectionNotifyEvent;

    fn clipboard(harness: &Harness) -> Selection {
        Selection::new(
            &harness.ctx(),
            SelectionKind::Clipboard,
            Size::from((10, 10)),
            WindowClass::INPUT_OUTPUT,
            EventMask::PROPERTY_CHANGE,
        )
        .unwrap()
    }

    #[test]
    fn ownership_notifications() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let mut selection = clipboard(&harness);
        let window = selection.window();
        assert!(harness.conn.take_requests().contains(&Request::SelectSelectionEvents {
            window,
            selection: atoms.CLIPBOARD,
        }));

        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        selection.set_wl_source(Some(WlSource::new(&source)));
        selection.own_selection(&ctx, true).unwrap();
        assert!(matches!(
            selection.handle_xfixes_notify(&xfixes_notify(window, window, atoms.CLIPBOARD, 42)),
            OwnerChange::Handled
        ));
        assert_eq!(selection.wl_source().unwrap().timestamp(), 42);

        assert!(matches!(
            selection.handle_xfixes_notify(&xfixes_notify(window, 0x99, atoms.PRIMARY, 43)),
            OwnerChange::NotMine
        ));
        assert!(matches!(
            selection.handle_xfixes_notify(&xfixes_notify(window, 0x99, atoms.CLIPBOARD, 43)),
            OwnerChange::Foreign(event) if event.owner == 0x99
        ));

        selection.own_selection(&ctx, false).unwrap();
        assert!(harness.conn.take_requests().contains(&Request::SetSelectionOwner {
            owner: NONE,
            selection: atoms.CLIPBOARD,
            time: 42,
        }));
        assert!(matches!(
            selection.handle_xfixes_notify(&xfixes_notify(window, NONE, atoms.CLIPBOARD, 44)),
            OwnerChange::Handled
        ));
    }

    #[test]
    fn sources_are_exclusive() {
        let harness = Harness::new();
        let atoms = harness.atoms;
        let mut selection = clipboard(&harness);
        let window = selection.window();

        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        selection.set_wl_source(Some(WlSource::new(&source)));
        selection.create_x11_source(Some(&xfixes_notify(window, 0x99, atoms.CLIPBOARD, 1)));
        assert!(selection.wl_source().is_none());
        assert_eq!(selection.x11_source().unwrap().owner(), 0x99);

        selection.create_x11_source(Some(&xfixes_notify(window, NONE, atoms.CLIPBOARD, 2)));
        assert!(selection.x11_source().is_none());
    }

    #[test]
    fn stale_requests_are_refused() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let mut selection = clipboard(&harness);
        let window = selection.window();
        selection.handle_xfixes_notify(&xfixes_notify(window, window, atoms.CLIPBOARD, 100));
        harness.conn.take_requests();

        let mut request = selection_request(0x99, 0x20, atoms.CLIPBOARD, atoms.TARGETS, 0x30);
        request.time = 50;
        assert!(selection.handle_selection_request(&ctx, &request, Instant::now()));
        assert!(matches!(
            harness.conn.take_requests().as_slice(),
            [Request::SelectionNotify(notify)] if notify.property == NONE
        ));

        request.time = 150;
        assert!(!selection.handle_selection_request(&ctx, &request, Instant::now()));
    }

    #[test]
    fn targets_reply_updates_offers() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let mut selection = clipboard(&harness);
        let window = selection.window();

        selection.create_x11_source(Some(&xfixes_notify(window, 0x99, atoms.CLIPBOARD, 1)));
        selection.x11_source_mut().unwrap().get_targets(&ctx).unwrap();
        assert!(selection.handle_selection_notify(
            &ctx,
            &SelectionNotifyEvent {
                response_type: SELECTION_NOTIFY_EVENT,
                sequence: 0,
                time: 1,
                requestor: window,
                selection: atoms.CLIPBOARD,
                target: atoms.TARGETS,
                property: atoms.WL_SELECTION,
            }
        ));
        let id = harness.conn.last_property_request().unwrap().id;
        assert!(selection.handle_property_reply(
            &ctx,
            id,
            &Some(targets_reply(&[atoms.UTF8_STRING])),
            Instant::now()
        ));
        assert_eq!(selection.take_updates(), vec![SelectionUpdate::OffersChanged]);
        assert_eq!(
            selection.x11_source().unwrap().mime_types(),
            vec!["text/plain;charset=utf-8"]
        );
    }

    #[test]
    fn transfers_report_their_end() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let mut selection = clipboard(&harness);
        let window = selection.window();
        let now = Instant::now();

        selection.create_x11_source(Some(&xfixes_notify(window, 0x99, atoms.CLIPBOARD, 9)));
        selection
            .x11_source_mut()
            .unwrap()
            .set_offers(vec![crate::xwayland::sources::Offer {
                mime_type: "text/plain".into(),
                atom: atoms.TEXT,
            }]);

        let (_read, write) = rustix::pipe::pipe().unwrap();
        assert!(!selection.start_transfer_to_wayland(&ctx, "image/png", write, now));

        let (_read, write) = rustix::pipe::pipe().unwrap();
        assert!(selection.start_transfer_to_wayland(&ctx, "text/plain", write, now));
        assert_eq!(selection.take_updates(), vec![SelectionUpdate::TransferStarted(9)]);
        assert!(selection.has_transfers());

        let timeout = ctx.config.transfer_timeout();
        selection.refresh(&ctx, now + timeout);
        assert_eq!(selection.take_updates(), vec![SelectionUpdate::TransferFinished(9)]);
        assert!(!selection.has_transfers());
    }
}
