// SPDX-License-Identifier: GPL-3.0-only

use smithay::utils::{Point, Size};
use tracing::{debug, trace};
use x11rb::{
    protocol::xproto::{
        Atom, AtomEnum, ClientMessageEvent, EventMask, GetPropertyReply, Window, WindowClass,
    },
    NONE,
};

use super::{action_to_atom, atom_to_action, send_message};
use crate::xwayland::{
    conn::{PropertyRequest, RequestId, XwlError},
    data_source::{DndAction, XwlDataSource},
    sources::{offers_from_targets, Offer, X11Source},
    BridgeCtx, BridgeHandler, WindowId,
};

/// An X11 sourced drag over a Wayland window.
///
/// A proxy window on top of everything else stands in for the Wayland
/// window, so the X11 source has someone to talk XDND to.
#[derive(Debug)]
pub struct WlVisit {
    target: WindowId,
    window: Window,
    source_window: Window,
    version: u32,
    action: DndAction,
    action_atom: Atom,
    type_list: Option<RequestId>,
    offers: Option<Vec<Offer>>,
    mapped: bool,
    entered: bool,
    drop_handled: bool,
    finished: bool,
    finish_pending: bool,
}

impl WlVisit {
    pub fn new(ctx: &BridgeCtx<'_>, target: WindowId) -> Result<WlVisit, XwlError> {
        let window = ctx.conn.create_window(
            ctx.conn.root(),
            Point::from((0, 0)),
            Size::from((8192, 8192)),
            WindowClass::INPUT_ONLY,
            EventMask::SUBSTRUCTURE_NOTIFY | EventMask::PROPERTY_CHANGE,
        )?;
        ctx.conn.change_property32(
            window,
            ctx.atoms.XdndAware,
            AtomEnum::ATOM.into(),
            &[ctx.config.xdnd_version()],
        )?;
        ctx.conn.map_window(window)?;
        ctx.conn.raise_window(window)?;
        ctx.conn.flush()?;
        trace!(?target, window, "Mapped drag proxy window.");

        Ok(WlVisit {
            target,
            window,
            source_window: NONE,
            version: 0,
            action: DndAction::None,
            action_atom: NONE,
            type_list: None,
            offers: None,
            mapped: true,
            entered: false,
            drop_handled: false,
            finished: false,
            finish_pending: false,
        })
    }

    pub fn target(&self) -> WindowId {
        self.target
    }

    /// The proxy window.
    pub fn window(&self) -> Window {
        self.window
    }

    #[cfg(test)]
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entered(&self) -> bool {
        self.entered
    }

    pub fn drop_handled(&self) -> bool {
        self.drop_handled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns true exactly once after the visit finished.
    pub fn take_finish(&mut self) -> bool {
        std::mem::take(&mut self.finish_pending)
    }

    /// Offers announced by the X11 source, once they are known.
    pub fn take_offers(&mut self) -> Option<Vec<Offer>> {
        self.offers.take()
    }

    pub fn handle_client_message(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        source: &XwlDataSource,
        x11_source: Option<&mut X11Source>,
        event: &ClientMessageEvent,
    ) -> Result<bool, XwlError> {
        if event.window != self.window {
            return Ok(false);
        }
        let atoms = ctx.atoms;
        let data = event.data.as_data32();
        if event.type_ == atoms.XdndEnter {
            self.handle_enter(ctx, data)?;
        } else if event.type_ == atoms.XdndPosition {
            self.handle_position(ctx, handler, source, x11_source, data)?;
        } else if event.type_ == atoms.XdndDrop {
            self.handle_drop(ctx, x11_source, data)?;
        } else if event.type_ == atoms.XdndLeave {
            self.handle_leave(ctx, data)?;
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_enter(&mut self, ctx: &BridgeCtx<'_>, data: [u32; 5]) -> Result<(), XwlError> {
        if self.entered {
            // a drag already entered
            return Ok(());
        }
        self.entered = true;
        self.source_window = data[0];
        self.version = (data[1] >> 24).min(ctx.config.xdnd_version());
        trace!(
            source = self.source_window,
            version = self.version,
            "Received XdndEnter."
        );

        if data[1] & 1 == 0 {
            // up to three types, inline
            self.offers = Some(offers_from_targets(ctx, &data[2..5])?);
        } else {
            let id = RequestId::next();
            ctx.conn.get_property(PropertyRequest {
                id,
                window: self.source_window,
                property: ctx.atoms.XdndTypeList,
                type_: AtomEnum::ANY.into(),
                delete: false,
                long_length: 0x1fffffff,
            })?;
            self.type_list = Some(id);
        }
        Ok(())
    }

    pub fn owns_request(&self, id: RequestId) -> bool {
        self.type_list == Some(id)
    }

    /// Reads the `XdndTypeList` of sources offering more than three types.
    pub fn handle_type_list(
        &mut self,
        ctx: &BridgeCtx<'_>,
        reply: Option<GetPropertyReply>,
    ) -> Result<(), XwlError> {
        self.type_list = None;
        let targets = reply
            .filter(|reply| reply.type_ == u32::from(AtomEnum::ATOM))
            .and_then(|reply| reply.value32().map(|value| value.collect::<Vec<_>>()))
            .unwrap_or_default();
        if targets.is_empty() {
            debug!(source = self.source_window, "XdndTypeList is empty or invalid.");
        }
        self.offers = Some(offers_from_targets(ctx, &targets)?);
        Ok(())
    }

    fn handle_position(
        &mut self,
        ctx: &BridgeCtx<'_>,
        handler: &dyn BridgeHandler,
        source: &XwlDataSource,
        x11_source: Option<&mut X11Source>,
        data: [u32; 5],
    ) -> Result<(), XwlError> {
        self.source_window = data[0];

        if handler.window(self.target).is_none() {
            // the Wayland window is gone
            self.action = DndAction::None;
            self.action_atom = NONE;
            return self.send_status(ctx, source.selected_action());
        }

        if let Some(x11_source) = x11_source {
            x11_source.set_timestamp(data[3]);
        }

        let requested = if self.version > 1 {
            data[4]
        } else {
            ctx.atoms.XdndActionCopy
        };
        let (action, action_atom) = match atom_to_action(ctx.atoms, requested) {
            // copy is always possible in XDND
            DndAction::None => (DndAction::Copy, ctx.atoms.XdndActionCopy),
            action => (action, requested),
        };
        if self.action != action {
            self.action = action;
            self.action_atom = action_atom;
            source.set_supported_actions(action.into());
        }

        self.send_status(ctx, source.selected_action())
    }

    fn handle_drop(
        &mut self,
        ctx: &BridgeCtx<'_>,
        x11_source: Option<&mut X11Source>,
        data: [u32; 5],
    ) -> Result<(), XwlError> {
        self.drop_handled = true;
        self.source_window = data[0];
        if let Some(x11_source) = x11_source {
            x11_source.set_timestamp(data[2]);
        }
        trace!(source = self.source_window, "Received XdndDrop.");
        // the data itself is moved by the X11 source's transfers
        self.finish(ctx)
    }

    fn handle_leave(&mut self, ctx: &BridgeCtx<'_>, data: [u32; 5]) -> Result<(), XwlError> {
        self.entered = false;
        self.source_window = data[0];
        trace!(source = self.source_window, "Received XdndLeave.");
        self.finish(ctx)
    }

    fn accepts_action(&self, selected: DndAction) -> bool {
        self.action != DndAction::None && (selected == self.action || selected == DndAction::Copy)
    }

    fn send_status(&self, ctx: &BridgeCtx<'_>, selected: DndAction) -> Result<(), XwlError> {
        // we want position updates
        let mut flags = 1 << 1;
        let mut action = NONE;
        if self.accepts_action(selected) {
            flags |= 1;
            action = self.action_atom;
        }
        send_message(
            ctx,
            self.source_window,
            ctx.atoms.XdndStatus,
            [self.window, flags, 0, 0, action],
        )
    }

    /// Whether the drop was accepted with some action.
    pub fn accepted(&self) -> bool {
        self.entered && self.action != DndAction::None
    }

    pub fn send_finished(&self, ctx: &BridgeCtx<'_>, accepted: bool) -> Result<(), XwlError> {
        let action = if accepted {
            action_to_atom(ctx.atoms, self.action)
        } else {
            NONE
        };
        trace!(source = self.source_window, accepted, "Sending XdndFinished.");
        send_message(
            ctx,
            self.source_window,
            ctx.atoms.XdndFinished,
            [self.window, accepted as u32, action, 0, 0],
        )
    }

    fn finish(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.finish_pending = true;
        self.unmap(ctx)
    }

    /// Stops standing in for the Wayland window. Returns whether the visit is finished.
    pub fn leave(&mut self, ctx: &BridgeCtx<'_>) -> Result<bool, XwlError> {
        self.unmap(ctx)?;
        Ok(self.finished)
    }

    fn unmap(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        ctx.conn.unmap_window(self.window)?;
        ctx.conn.flush()
    }

    pub fn destroy(self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        ctx.conn.destroy_window(self.window)?;
        ctx.conn.flush()
    }
}
