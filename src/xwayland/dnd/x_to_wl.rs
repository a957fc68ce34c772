// SPDX-License-Identifier: GPL-3.0-only

use std::{rc::Rc, time::Instant};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{ClientMessageEvent, GetPropertyReply, Timestamp};

use super::{wl_visit::WlVisit, DragEventReply};
use crate::xwayland::{
    conn::RequestId,
    data_source::{SourceId, XwlDataSource},
    selection::Selection,
    sources::Offer,
    BridgeCtx, BridgeHandler, WindowId,
};

/// A data request of the Wayland target, identified by the X11 source's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataRequest {
    timestamp: Timestamp,
    completed: bool,
}

/// Drag of an X11 client, possibly over Wayland windows.
#[derive(Debug)]
pub struct XToWlDrag {
    source: Rc<XwlDataSource>,
    visit: Option<WlVisit>,
    old_visits: Vec<WlVisit>,
    offers: Vec<Offer>,
    data_requests: SmallVec<[DataRequest; 4]>,
    deadline: Option<Instant>,
    dropped: bool,
    cancelled: bool,
    finished: bool,
}

impl XToWlDrag {
    pub fn new(source: Rc<XwlDataSource>) -> XToWlDrag {
        XToWlDrag {
            source,
            visit: None,
            old_visits: Vec::new(),
            offers: Vec::new(),
            data_requests: SmallVec::new(),
            deadline: None,
            dropped: false,
            cancelled: false,
            finished: false,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source.id()
    }

    #[cfg(test)]
    pub fn visit(&self) -> Option<&WlVisit> {
        self.visit.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn move_filter(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
        target: Option<WindowId>,
    ) -> DragEventReply {
        if self.finished {
            return DragEventReply::Ignore;
        }
        if let (Some(visit), Some(target)) = (&self.visit, target) {
            if visit.target() == target {
                // same Wayland target, X11 keeps driving
                return DragEventReply::Ignore;
            }
        }

        let had_visit = self.visit.is_some();
        if let Some(visit) = self.visit.take() {
            self.retire_visit(ctx, selection, visit);
        }

        let native = target.filter(|id| handler.window(*id).is_some_and(|info| !info.xwayland));
        let Some(target) = native else {
            // no target or an X11 window, X11 handles it directly
            if had_visit {
                // the last enter is void now, wait for the next one
                handler.set_drag_target(None);
            }
            return DragEventReply::Ignore;
        };

        match WlVisit::new(ctx, target) {
            Ok(visit) => {
                debug!(?target, proxy = visit.window(), "X11 drag entered Wayland window.");
                selection.overwrite_requestor(Some(visit.window()));
                self.visit = Some(visit);
                DragEventReply::Take
            }
            Err(err) => {
                warn!(?err, "Failed to create drag proxy window.");
                DragEventReply::Ignore
            }
        }
    }

    fn retire_visit(&mut self, ctx: &BridgeCtx<'_>, selection: &mut Selection, mut visit: WlVisit) {
        match visit.leave(ctx) {
            Ok(true) => destroy_visit(ctx, selection, visit),
            Ok(false) => self.old_visits.push(visit),
            Err(err) => {
                warn!(?err, "Failed to unmap drag proxy window.");
                self.old_visits.push(visit);
            }
        }
    }

    pub fn handle_client_message(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
        event: &ClientMessageEvent,
    ) -> bool {
        let source = &self.source;
        let handled = self.old_visits.iter_mut().any(|visit| {
            let x11_source = selection.x11_source_mut();
            match visit.handle_client_message(ctx, &*handler, source, x11_source, event) {
                Ok(handled) => handled,
                Err(err) => {
                    warn!(?err, "Failed to answer XDND message.");
                    true
                }
            }
        });
        if handled {
            self.collect_old_visits(ctx, selection);
            return true;
        }

        let Some(visit) = self.visit.as_mut() else {
            return false;
        };
        let x11_source = selection.x11_source_mut();
        match visit.handle_client_message(ctx, &*handler, &self.source, x11_source, event) {
            Ok(false) => return false,
            Ok(true) => {}
            Err(err) => warn!(?err, "Failed to answer XDND message."),
        }
        self.visit_updated(ctx, handler, selection);
        true
    }

    pub fn handle_property_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
        id: RequestId,
        reply: &Option<GetPropertyReply>,
    ) -> bool {
        if let Some(visit) = self.old_visits.iter_mut().find(|visit| visit.owns_request(id)) {
            // offers of a retired visit are of no interest anymore
            if let Err(err) = visit.handle_type_list(ctx, reply.clone()) {
                warn!(?err, "Failed to read XdndTypeList.");
            }
            visit.take_offers();
            return true;
        }
        let Some(visit) = self.visit.as_mut().filter(|visit| visit.owns_request(id)) else {
            return false;
        };
        if let Err(err) = visit.handle_type_list(ctx, reply.clone()) {
            warn!(?err, "Failed to read XdndTypeList.");
        }
        self.visit_updated(ctx, handler, selection);
        true
    }

    /// Reacts to whatever the current visit learned from its last message.
    fn visit_updated(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
    ) {
        let Some(visit) = self.visit.as_mut() else {
            return;
        };
        let offers = visit.take_offers();
        let finished = visit.take_finish();
        if let Some(offers) = offers {
            self.set_offers(handler, selection, offers);
        }
        if finished {
            trace!("Drag proxy visit finished.");
            if self.cancelled {
                self.finish_cancelled(ctx);
            } else if self.dropped {
                self.check_for_finished(ctx);
            }
        }
    }

    fn set_offers(
        &mut self,
        handler: &mut dyn BridgeHandler,
        selection: &mut Selection,
        offers: Vec<Offer>,
    ) {
        if let Some(source) = selection.x11_source_mut() {
            source.set_offers(offers.clone());
        }
        if !offers.is_empty() && self.offers != offers {
            let mime_types = offers
                .iter()
                .map(|offer| offer.mime_type.clone())
                .collect::<Vec<_>>();
            debug!(?mime_types, "X11 drag offers changed.");
            self.source.set_mime_types(mime_types);
            self.offers = offers;
        }
        // without offers no transfer is possible, the target is set anyway
        if let Some(visit) = &self.visit {
            handler.set_drag_target(Some(visit.target()));
        }
    }

    fn collect_old_visits(&mut self, ctx: &BridgeCtx<'_>, selection: &mut Selection) {
        let (finished, parked) = std::mem::take(&mut self.old_visits)
            .into_iter()
            .partition::<Vec<_>, _>(WlVisit::is_finished);
        self.old_visits = parked;
        for visit in finished {
            destroy_visit(ctx, selection, visit);
        }
    }

    /// A transfer for this drag started.
    pub fn transfer_started(&mut self, timestamp: Timestamp) {
        self.data_requests.push(DataRequest {
            timestamp,
            completed: false,
        });
    }

    /// Marks the transfer started at `timestamp` as done. Returns whether it was ours.
    pub fn transfer_finished(&mut self, ctx: &BridgeCtx<'_>, timestamp: Timestamp) -> bool {
        let Some(request) = self
            .data_requests
            .iter_mut()
            .find(|request| request.timestamp == timestamp && !request.completed)
        else {
            return false;
        };
        // some Wayland clients never call finish, the transfer is what counts
        request.completed = true;
        self.check_for_finished(ctx);
        true
    }

    /// The seat dropped onto the current target.
    pub fn dropped(&mut self, ctx: &BridgeCtx<'_>, now: Instant) {
        self.dropped = true;
        if self.visit.is_some() {
            self.deadline = Some(now + ctx.config.drop_grace_period());
        }
        self.check_for_finished(ctx);
    }

    /// The Wayland target is done with the data.
    pub fn dnd_finished(&mut self, ctx: &BridgeCtx<'_>) {
        self.check_for_finished(ctx);
    }

    pub fn cancelled(&mut self, ctx: &BridgeCtx<'_>, now: Instant) {
        self.cancelled = true;
        let waiting = match self.visit.as_mut() {
            Some(visit) => match visit.leave(ctx) {
                Ok(finished) => !finished,
                Err(err) => {
                    warn!(?err, "Failed to unmap drag proxy window.");
                    !visit.is_finished()
                }
            },
            None => false,
        };
        if waiting {
            // the X11 source still has to learn about the end of the drag
            self.deadline = Some(now + ctx.config.drop_grace_period());
        } else {
            self.finish_cancelled(ctx);
        }
    }

    fn finish_cancelled(&mut self, ctx: &BridgeCtx<'_>) {
        if let Some(visit) = self.visit.as_ref().filter(|visit| visit.drop_handled()) {
            if let Err(err) = visit.send_finished(ctx, false) {
                warn!(?err, "Failed to send XdndFinished.");
            }
        }
        self.finish();
    }

    /// Finishes the drag once the X11 source dropped and all data was sent.
    fn check_for_finished(&mut self, ctx: &BridgeCtx<'_>) -> bool {
        if self.finished {
            return true;
        }
        let Some(visit) = self.visit.as_ref() else {
            // not dropped above a Wayland window
            self.finish();
            return true;
        };
        if !visit.is_finished() {
            return false;
        }
        if self.data_requests.is_empty() {
            // wait for the first data request
            return false;
        }
        if !self.data_requests.iter().all(|request| request.completed) {
            return false;
        }
        if let Err(err) = visit.send_finished(ctx, visit.accepted()) {
            warn!(?err, "Failed to send XdndFinished.");
        }
        self.finish();
        true
    }

    /// Gives up on peers that did not complete the drop in time.
    pub fn refresh(&mut self, ctx: &BridgeCtx<'_>, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if self.finished || now < deadline {
            return;
        }
        self.deadline = None;

        if self.cancelled {
            debug!("X11 drag source did not react to the cancellation.");
            self.finish_cancelled(ctx);
            return;
        }
        match self.visit.as_ref() {
            Some(visit) if !visit.entered() || !visit.drop_handled() => {
                debug!("X11 drag source timed out.");
                self.finish();
            }
            Some(visit) if self.data_requests.is_empty() => {
                debug!("Wayland drop target never requested data.");
                if let Err(err) = visit.send_finished(ctx, visit.accepted()) {
                    warn!(?err, "Failed to send XdndFinished.");
                }
                self.finish();
            }
            Some(_) => {}
            None => self.finish(),
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            trace!(source = ?self.source.id(), "X11 drag finished.");
            self.finished = true;
            self.deadline = None;
        }
    }

    /// Releases the proxy windows.
    pub fn destroy(self, ctx: &BridgeCtx<'_>, selection: &mut Selection) {
        for visit in self.old_visits.into_iter().chain(self.visit) {
            destroy_visit(ctx, selection, visit);
        }
    }
}

fn destroy_visit(ctx: &BridgeCtx<'_>, selection: &mut Selection, visit: WlVisit) {
    if selection.requestor() == visit.window() {
        selection.overwrite_requestor(None);
    }
    if let Err(err) = visit.destroy(ctx) {
        warn!(?err, "Failed to destroy drag proxy window.");
    }
}
