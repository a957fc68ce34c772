// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::Serial;
use x11rb::protocol::xproto::{ClientMessageEvent, GetPropertyReply, Window};

use super::{drop_handler::XwlDropHandler, DragEventReply};
use crate::xwayland::{conn::RequestId, BridgeCtx, BridgeHandler, WindowId};

/// Drag of a Wayland client, possibly over X11 windows.
#[derive(Debug)]
pub struct WlToXDrag {
    drop_handler: XwlDropHandler,
    ended: bool,
}

impl WlToXDrag {
    pub fn new(dnd_window: Window) -> WlToXDrag {
        WlToXDrag {
            drop_handler: XwlDropHandler::new(dnd_window),
            ended: false,
        }
    }

    /// The seat keeps handling the pointer, X11 targets only get the motion.
    pub fn move_filter(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
    ) -> DragEventReply {
        self.drop_handler.motion(ctx, handler);
        DragEventReply::Wayland
    }

    pub fn update_drag_target(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        target: Option<WindowId>,
        serial: Serial,
    ) {
        self.drop_handler
            .update_drag_target(ctx, handler, target, serial);
    }

    pub fn drop(&mut self, ctx: &BridgeCtx<'_>) {
        self.drop_handler.drop(ctx);
    }

    pub fn handle_client_message(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        event: &ClientMessageEvent,
    ) -> bool {
        self.drop_handler.handle_client_message(ctx, handler, event)
    }

    pub fn handle_property_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        id: RequestId,
        reply: &Option<GetPropertyReply>,
    ) -> bool {
        self.drop_handler
            .handle_property_reply(ctx, handler, id, reply)
    }

    /// The seat drag is over.
    pub fn end(&mut self, ctx: &BridgeCtx<'_>) {
        self.ended = true;
        self.drop_handler.cancel(ctx);
    }

    pub fn is_finished(&self) -> bool {
        self.ended && self.drop_handler.is_finished()
    }
}
