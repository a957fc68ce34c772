// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::Serial;
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{ClientMessageEvent, GetPropertyReply, Window};

use super::xvisit::Xvisit;
use crate::xwayland::{conn::RequestId, BridgeCtx, BridgeHandler, WindowId};

/// Drop target for Wayland drags over X11 windows.
#[derive(Debug)]
pub struct XwlDropHandler {
    dnd_window: Window,
    visit: Option<Xvisit>,
    previous: Vec<Xvisit>,
}

impl XwlDropHandler {
    pub fn new(dnd_window: Window) -> XwlDropHandler {
        XwlDropHandler {
            dnd_window,
            visit: None,
            previous: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn current_visit(&self) -> Option<&Xvisit> {
        self.visit.as_ref()
    }

    /// The seat's drag focus moved to `target`.
    pub fn update_drag_target(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        target: Option<WindowId>,
        serial: Serial,
    ) {
        let resolved = target.and_then(|id| {
            handler
                .window(id)
                .filter(|info| info.xwayland)
                .and_then(|info| info.x11_window)
        });
        if let (Some(visit), Some(window)) = (&self.visit, resolved) {
            if visit.window() == window {
                return;
            }
        }
        trace!(?target, ?serial, "Drag target changed.");

        if let Some(mut visit) = self.visit.take() {
            if let Err(err) = visit.leave(ctx) {
                warn!(?err, "Failed to leave drop target.");
            }
            if !visit.is_finished() {
                self.previous.push(visit);
            }
        }

        let Some(window) = resolved else {
            return;
        };
        let Some(source) = handler.drag_source() else {
            debug!("No drag source to offer to X11.");
            return;
        };
        match Xvisit::new(ctx, window, self.dnd_window, &source) {
            Ok(visit) => self.visit = Some(visit),
            Err(err) => warn!(?err, window, "Failed to start X11 drop target visit."),
        }
    }

    pub fn motion(&mut self, ctx: &BridgeCtx<'_>, handler: &dyn BridgeHandler) {
        if let Some(visit) = self.visit.as_mut() {
            if let Err(err) = visit.motion(ctx, handler.pointer_location()) {
                warn!(?err, "Failed to send drag position.");
            }
        }
    }

    pub fn drop(&mut self, ctx: &BridgeCtx<'_>) {
        if let Some(visit) = self.visit.as_mut() {
            if let Err(err) = visit.drop(ctx) {
                warn!(?err, "Failed to drop onto X11 window.");
            }
        }
    }

    pub fn handle_client_message(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        event: &ClientMessageEvent,
    ) -> bool {
        let pointer = handler.pointer_location();
        let handled = self
            .previous
            .iter_mut()
            .chain(self.visit.as_mut())
            .any(|visit| match visit.handle_client_message(ctx, event, pointer) {
                Ok(handled) => handled,
                Err(err) => {
                    warn!(?err, "Failed to answer XDND message.");
                    true
                }
            });
        self.collect();
        handled
    }

    pub fn handle_property_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        id: RequestId,
        reply: &Option<GetPropertyReply>,
    ) -> bool {
        let Some(visit) = self
            .previous
            .iter_mut()
            .chain(self.visit.as_mut())
            .find(|visit| visit.owns_request(id))
        else {
            return false;
        };
        if let Err(err) = visit.handle_aware_reply(ctx, reply.clone(), handler.pointer_location()) {
            warn!(?err, "Failed to enter X11 drop target.");
        }
        self.collect();
        true
    }

    /// Leaves the current target, dropped visits stay until they are finished.
    pub fn cancel(&mut self, ctx: &BridgeCtx<'_>) {
        if let Some(visit) = self.visit.as_mut() {
            if let Err(err) = visit.leave(ctx) {
                warn!(?err, "Failed to leave drop target.");
            }
        }
        self.collect();
    }

    fn collect(&mut self) {
        self.previous.retain_mut(|visit| {
            if visit.take_finish() {
                trace!(window = visit.window(), "Retired drop target visit finished.");
                false
            } else {
                true
            }
        });
        if let Some(visit) = self.visit.as_mut() {
            if visit.take_finish() {
                trace!(window = visit.window(), "Drop target visit finished.");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.previous.is_empty() && self.visit.as_ref().map_or(true, Xvisit::is_finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xwayland::{
        data_source::DataSource,
        testing::{client_message, targets_reply, Harness, MockHandler, TestSource},
        WindowInfo,
    };
    use std::rc::Rc;

    const DND_WINDOW: Window = 0x40;
    const FIRST: WindowId = WindowId(1);
    const SECOND: WindowId = WindowId(2);
    const NATIVE: WindowId = WindowId(3);

    fn handler() -> MockHandler {
        let mut handler = MockHandler::default();
        handler.windows.insert(
            FIRST,
            WindowInfo {
                x11_window: Some(0x51),
                xwayland: true,
            },
        );
        handler.windows.insert(
            SECOND,
            WindowInfo {
                x11_window: Some(0x52),
                xwayland: true,
            },
        );
        handler.windows.insert(
            NATIVE,
            WindowInfo {
                x11_window: None,
                xwayland: false,
            },
        );
        let source: Rc<dyn DataSource> = TestSource::new(&["text/plain"]);
        handler.drag = Some(source);
        handler
    }

    fn enter(harness: &Harness, handler: &MockHandler, drop_handler: &mut XwlDropHandler) {
        let id = harness.conn.last_property_request().unwrap().id;
        assert!(drop_handler.handle_property_reply(
            &harness.ctx(),
            handler,
            id,
            &Some(targets_reply(&[5]))
        ));
    }

    #[test]
    fn visits_follow_the_drag_target() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let handler = handler();
        let mut drop_handler = XwlDropHandler::new(DND_WINDOW);

        drop_handler.update_drag_target(&ctx, &handler, Some(FIRST), Serial::from(1));
        enter(&harness, &handler, &mut drop_handler);
        assert_eq!(drop_handler.current_visit().unwrap().window(), 0x51);
        assert!(drop_handler.current_visit().unwrap().entered());

        // same target again
        drop_handler.update_drag_target(&ctx, &handler, Some(FIRST), Serial::from(2));
        assert!(drop_handler.current_visit().unwrap().entered());

        harness.conn.take_requests();
        drop_handler.update_drag_target(&ctx, &handler, Some(SECOND), Serial::from(3));
        let messages = harness.conn.take_client_messages();
        assert_eq!(messages, vec![(0x51, harness.atoms.XdndLeave, [DND_WINDOW, 0, 0, 0, 0])]);
        assert_eq!(drop_handler.current_visit().unwrap().window(), 0x52);

        // native Wayland windows are not our business
        drop_handler.update_drag_target(&ctx, &handler, Some(NATIVE), Serial::from(4));
        assert!(drop_handler.current_visit().is_none());
        assert!(drop_handler.is_finished());
    }

    #[test]
    fn dropped_visits_are_parked() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let atoms = harness.atoms;
        let handler = handler();
        let mut drop_handler = XwlDropHandler::new(DND_WINDOW);

        drop_handler.update_drag_target(&ctx, &handler, Some(FIRST), Serial::from(1));
        enter(&harness, &handler, &mut drop_handler);
        let status = client_message(
            DND_WINDOW,
            atoms.XdndStatus,
            [0x51, 1, 0, 0, atoms.XdndActionCopy],
        );
        assert!(drop_handler.handle_client_message(&ctx, &handler, &status));
        drop_handler.drop(&ctx);
        assert!(drop_handler.current_visit().unwrap().dropped());

        drop_handler.update_drag_target(&ctx, &handler, None, Serial::from(2));
        assert!(drop_handler.current_visit().is_none());
        assert!(!drop_handler.is_finished());

        let finished = client_message(
            DND_WINDOW,
            atoms.XdndFinished,
            [0x51, 1, atoms.XdndActionCopy, 0, 0],
        );
        assert!(drop_handler.handle_client_message(&ctx, &handler, &finished));
        assert!(drop_handler.is_finished());

        let unknown = client_message(DND_WINDOW, atoms.XdndFinished, [0x51, 1, 0, 0, 0]);
        assert!(!drop_handler.handle_client_message(&ctx, &handler, &unknown));
    }

    #[test]
    fn cancel_leaves_the_target() {
        let harness = Harness::new();
        let ctx = harness.ctx();
        let handler = handler();
        let mut drop_handler = XwlDropHandler::new(DND_WINDOW);

        drop_handler.update_drag_target(&ctx, &handler, Some(FIRST), Serial::from(1));
        enter(&harness, &handler, &mut drop_handler);
        assert!(!drop_handler.is_finished());
        harness.conn.take_requests();

        drop_handler.cancel(&ctx);
        assert!(drop_handler.is_finished());
        assert_eq!(
            harness.conn.take_client_messages(),
            vec![(0x51, harness.atoms.XdndLeave, [DND_WINDOW, 0, 0, 0, 0])]
        );
    }

    #[test]
    fn no_drag_source_no_visit() {
        let harness = Harness::new();
        let mut handler = handler();
        handler.drag = None;
        let mut drop_handler = XwlDropHandler::new(DND_WINDOW);

        drop_handler.update_drag_target(&harness.ctx(), &handler, Some(FIRST), Serial::from(1));
        assert!(drop_handler.current_visit().is_none());
    }
}
