// SPDX-License-Identifier: GPL-3.0-only

use std::rc::{Rc, Weak};

use smithay::utils::{Logical, Point};
use tracing::{debug, trace};
use x11rb::{
    protocol::xproto::{AtomEnum, ClientMessageEvent, GetPropertyReply, Window},
    CURRENT_TIME, NONE,
};

use super::{action_to_atom, atom_to_action, send_message};
use crate::xwayland::{
    atoms::atom_for_mime,
    conn::{PropertyRequest, RequestId, XwlError},
    data_source::{DataSource, DndAction, DndActions},
    BridgeCtx,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum PositionState {
    Idle,
    /// Waiting for the `XdndStatus` answering our last position.
    Pending,
    /// Like `Pending`, with the latest position to send afterwards.
    PendingCached(Point<i32, Logical>),
}

/// A Wayland sourced drag over an X11 window.
#[derive(Debug)]
pub struct Xvisit {
    window: Window,
    dnd_window: Window,
    source: Weak<dyn DataSource>,
    version: u32,
    aware_request: Option<RequestId>,
    position: PositionState,
    accepts: bool,
    preferred_action: DndAction,
    proposed_action: DndAction,
    supported_actions: DndActions,
    entered: bool,
    dropped: bool,
    finished: bool,
    finish_pending: bool,
}

impl Xvisit {
    /// Starts a visit of the X11 `window` by asking for its XDND version.
    pub fn new(
        ctx: &BridgeCtx<'_>,
        window: Window,
        dnd_window: Window,
        source: &Rc<dyn DataSource>,
    ) -> Result<Xvisit, XwlError> {
        let id = RequestId::next();
        ctx.conn.get_property(PropertyRequest {
            id,
            window,
            property: ctx.atoms.XdndAware,
            type_: AtomEnum::ANY.into(),
            delete: false,
            long_length: 1,
        })?;

        Ok(Xvisit {
            window,
            dnd_window,
            source: Rc::downgrade(source),
            version: 0,
            aware_request: Some(id),
            position: PositionState::Idle,
            accepts: false,
            preferred_action: DndAction::None,
            proposed_action: DndAction::None,
            supported_actions: DndActions::empty(),
            entered: false,
            dropped: false,
            finished: false,
            finish_pending: false,
        })
    }

    pub fn window(&self) -> Window {
        self.window
    }

    #[cfg(test)]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[cfg(test)]
    pub fn entered(&self) -> bool {
        self.entered
    }

    #[cfg(test)]
    pub fn dropped(&self) -> bool {
        self.dropped
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[cfg(test)]
    pub fn proposed_action(&self) -> DndAction {
        self.proposed_action
    }

    /// Returns true exactly once after the visit finished.
    pub fn take_finish(&mut self) -> bool {
        std::mem::take(&mut self.finish_pending)
    }

    pub fn owns_request(&self, id: RequestId) -> bool {
        self.aware_request == Some(id)
    }

    /// Evaluates the target's `XdndAware` property and enters it if possible.
    pub fn handle_aware_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        reply: Option<GetPropertyReply>,
        pointer: Point<f64, Logical>,
    ) -> Result<(), XwlError> {
        self.aware_request = None;
        if self.finished {
            return Ok(());
        }
        let announced = reply
            .filter(|reply| reply.type_ == u32::from(AtomEnum::ATOM))
            .and_then(|reply| reply.value32().and_then(|mut value| value.next()));
        let Some(announced) = announced else {
            debug!(window = self.window, "Drop target is not XDND aware.");
            self.finish();
            return Ok(());
        };

        self.version = announced.min(ctx.config.xdnd_version());
        if self.version < 1 {
            // minimal version we accept is 1
            debug!(window = self.window, announced, "Unsupported XDND version.");
            self.finish();
            return Ok(());
        }

        self.receive_offer(ctx, pointer)
    }

    fn receive_offer(
        &mut self,
        ctx: &BridgeCtx<'_>,
        pointer: Point<f64, Logical>,
    ) -> Result<(), XwlError> {
        self.retrieve_supported_actions(ctx, pointer)?;
        self.enter(ctx, pointer)
    }

    fn enter(&mut self, ctx: &BridgeCtx<'_>, pointer: Point<f64, Logical>) -> Result<(), XwlError> {
        self.entered = true;
        self.send_enter(ctx)?;
        self.send_position(ctx, pointer.to_i32_round())
    }

    fn send_enter(&self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        let Some(source) = self.source.upgrade() else {
            return Ok(());
        };
        let mut targets = Vec::new();
        for mime_type in source.mime_types() {
            let atom = atom_for_mime(ctx.conn, ctx.atoms, &mime_type)?;
            if atom != NONE && !targets.contains(&atom) {
                targets.push(atom);
            }
        }

        let mut data = [self.dnd_window, self.version << 24, NONE, NONE, NONE];
        for (slot, atom) in data[2..].iter_mut().zip(&targets) {
            *slot = *atom;
        }
        if targets.len() > 3 {
            data[1] |= 1;
            ctx.conn.change_property32(
                self.dnd_window,
                ctx.atoms.XdndTypeList,
                AtomEnum::ATOM.into(),
                &targets,
            )?;
        }
        trace!(window = self.window, version = self.version, "Sending XdndEnter.");
        send_message(ctx, self.window, ctx.atoms.XdndEnter, data)
    }

    /// Forwards pointer motion to the target.
    pub fn motion(
        &mut self,
        ctx: &BridgeCtx<'_>,
        pointer: Point<f64, Logical>,
    ) -> Result<(), XwlError> {
        if !self.entered || self.dropped || self.finished {
            return Ok(());
        }
        let supported = self
            .source
            .upgrade()
            .map(|source| source.supported_actions())
            .unwrap_or_default();
        if supported != self.supported_actions {
            self.retrieve_supported_actions(ctx, pointer)?;
        }
        self.send_position(ctx, pointer.to_i32_round())
    }

    fn send_position(
        &mut self,
        ctx: &BridgeCtx<'_>,
        pos: Point<i32, Logical>,
    ) -> Result<(), XwlError> {
        if self.finished {
            return Ok(());
        }
        if self.position != PositionState::Idle {
            self.position = PositionState::PendingCached(pos);
            return Ok(());
        }
        self.position = PositionState::Pending;

        let x = pos.x as i16 as u16 as u32;
        let y = pos.y as i16 as u16 as u32;
        send_message(
            ctx,
            self.window,
            ctx.atoms.XdndPosition,
            [
                self.dnd_window,
                0,
                (x << 16) | y,
                CURRENT_TIME,
                action_to_atom(ctx.atoms, self.proposed_action),
            ],
        )
    }

    fn retrieve_supported_actions(
        &mut self,
        ctx: &BridgeCtx<'_>,
        pointer: Point<f64, Logical>,
    ) -> Result<(), XwlError> {
        self.supported_actions = self
            .source
            .upgrade()
            .map(|source| source.supported_actions())
            .unwrap_or_default();
        self.determine_proposed_action(ctx, pointer)?;
        self.request_action();
        Ok(())
    }

    fn determine_proposed_action(
        &mut self,
        ctx: &BridgeCtx<'_>,
        pointer: Point<f64, Logical>,
    ) -> Result<(), XwlError> {
        let previous = self.proposed_action;
        self.proposed_action = if self.preferred_action.is_supported_by(self.supported_actions) {
            self.preferred_action
        } else if DndAction::Copy.is_supported_by(self.supported_actions) {
            DndAction::Copy
        } else {
            DndAction::None
        };
        // tell the target about the new action
        if previous != self.proposed_action && self.entered {
            self.send_position(ctx, pointer.to_i32_round())?;
        }
        Ok(())
    }

    /// Picks the action for the Wayland source, there is no data device in between.
    fn request_action(&self) {
        let wanted = match self.preferred_action {
            DndAction::None => DndAction::Copy,
            action => action,
        };
        // the X11 client might not support move, the drag is cancelled then
        let action = if wanted.is_supported_by(self.supported_actions) {
            wanted
        } else if DndAction::Copy.is_supported_by(self.supported_actions) {
            DndAction::Copy
        } else if DndAction::Move.is_supported_by(self.supported_actions) {
            DndAction::Move
        } else {
            wanted
        };
        if let Some(source) = self.source.upgrade() {
            source.set_dnd_action(action);
        }
    }

    pub fn handle_client_message(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &ClientMessageEvent,
        pointer: Point<f64, Logical>,
    ) -> Result<bool, XwlError> {
        if event.type_ == ctx.atoms.XdndStatus {
            self.handle_status(ctx, event.data.as_data32(), pointer)
        } else if event.type_ == ctx.atoms.XdndFinished {
            Ok(self.handle_finished(event.data.as_data32()))
        } else {
            Ok(false)
        }
    }

    fn handle_status(
        &mut self,
        ctx: &BridgeCtx<'_>,
        data: [u32; 5],
        pointer: Point<f64, Logical>,
    ) -> Result<bool, XwlError> {
        if data[0] != self.window {
            return Ok(false);
        }
        if self.finished {
            return Ok(true);
        }
        self.accepts = data[1] & 1 != 0;
        let action_atom = data[4];
        trace!(window = self.window, accepts = self.accepts, action_atom, "Received XdndStatus.");

        if let Some(source) = self.source.upgrade() {
            let mime_types = source.mime_types();
            if let Some(first) = mime_types.first() {
                source.accept(self.accepts.then_some(first.as_str()));
            }
        }

        // position round trip finished
        let cached = match std::mem::replace(&mut self.position, PositionState::Idle) {
            PositionState::PendingCached(pos) => Some(pos),
            _ => None,
        };

        if !self.dropped {
            self.preferred_action = atom_to_action(ctx.atoms, action_atom);
            self.determine_proposed_action(ctx, pointer)?;
            self.request_action();
        }

        if let Some(pos) = cached {
            self.send_position(ctx, pos)?;
        } else if self.dropped {
            // the drop happened in between
            self.drop(ctx)?;
        }
        Ok(true)
    }

    fn handle_finished(&mut self, data: [u32; 5]) -> bool {
        if data[0] != self.window {
            return false;
        }
        if self.finished {
            return true;
        }
        trace!(window = self.window, accepted = data[1] & 1, "Received XdndFinished.");
        if self.dropped {
            if let Some(source) = self.source.upgrade() {
                source.dnd_finished();
            }
        }
        self.finish();
        true
    }

    /// The Wayland side dropped onto the target.
    pub fn drop(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        if self.finished {
            return Ok(());
        }
        self.dropped = true;
        if !self.entered {
            // wait for the XdndAware reply
            return Ok(());
        }
        if self.position != PositionState::Idle {
            // wait for the pending position round trip
            return Ok(());
        }
        if !self.accepts {
            debug!(window = self.window, "Drop target rejected the offer.");
            self.send_leave(ctx)?;
            self.finish();
            return Ok(());
        }

        send_message(
            ctx,
            self.window,
            ctx.atoms.XdndDrop,
            [self.dnd_window, 0, CURRENT_TIME, 0, 0],
        )?;
        if self.version < 2 {
            // no XdndFinished before version 2
            if let Some(source) = self.source.upgrade() {
                source.dnd_finished();
            }
            self.finish();
        }
        Ok(())
    }

    /// The drag moved away from the target.
    pub fn leave(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        if self.dropped || self.finished {
            // dropped visits finish with XdndFinished
            return Ok(());
        }
        if self.entered {
            self.send_leave(ctx)?;
        }
        self.finish();
        Ok(())
    }

    fn send_leave(&self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        send_message(
            ctx,
            self.window,
            ctx.atoms.XdndLeave,
            [self.dnd_window, 0, 0, 0, 0],
        )
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.finish_pending = true;
        if let PositionState::PendingCached(_) = self.position {
            self.position = PositionState::Pending;
        }
    }
}
