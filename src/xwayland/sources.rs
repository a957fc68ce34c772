// SPDX-License-Identifier: GPL-3.0-only

use std::{
    os::fd::OwnedFd,
    rc::{Rc, Weak},
};

use rustix::pipe::{pipe_with, PipeFlags};
use smithay::utils::IsAlive;
use tracing::{debug, warn};
use x11rb::{
    protocol::{
        xfixes,
        xproto::{
            Atom, AtomEnum, GetPropertyReply, SelectionNotifyEvent, SelectionRequestEvent,
            Timestamp, Window,
        },
    },
    NONE,
};

use super::{
    atoms::{atom_for_mime, mime_types_for_atom, MIME_URI_LIST, MIME_X_URI},
    conn::{PropertyRequest, RequestId, XwlError},
    data_source::DataSource,
    selection::send_selection_notify,
    BridgeCtx,
};

/// A mime type offered by an X11 selection owner and the target atom it is read through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub mime_type: String,
    pub atom: Atom,
}

/// Converts a list of X11 targets into offers.
///
/// Meta targets are skipped, targets standing for several mime types
/// produce an offer for each of them.
pub fn offers_from_targets(ctx: &BridgeCtx<'_>, targets: &[Atom]) -> Result<Vec<Offer>, XwlError> {
    let mut offers = Vec::<Offer>::new();
    for &atom in targets {
        if atom == NONE || ctx.atoms.is_meta_target(atom) {
            continue;
        }
        for mime_type in mime_types_for_atom(ctx.conn, ctx.atoms, atom)? {
            if !offers.iter().any(|offer| offer.mime_type == mime_type) {
                offers.push(Offer { mime_type, atom });
            }
        }
    }
    Ok(offers)
}

/// How a selection request was answered.
#[derive(Debug)]
pub enum RequestOutcome {
    Replied,
    /// Data has to be moved from this pipe to the requestor.
    Transfer(OwnedFd),
}

/// Wayland owned selection, offered to X11 clients.
#[derive(Debug)]
pub struct WlSource {
    source: Weak<dyn DataSource>,
    timestamp: Timestamp,
}

impl WlSource {
    pub fn new(source: &Rc<dyn DataSource>) -> WlSource {
        WlSource {
            source: Rc::downgrade(source),
            timestamp: x11rb::CURRENT_TIME,
        }
    }

    #[cfg(test)]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    pub fn is_source(&self, source: &Rc<dyn DataSource>) -> bool {
        std::ptr::addr_eq(self.source.as_ptr(), Rc::as_ptr(source))
    }

    pub fn handle_selection_request(
        &self,
        ctx: &BridgeCtx<'_>,
        request: &SelectionRequestEvent,
    ) -> Result<RequestOutcome, XwlError> {
        let atoms = ctx.atoms;
        if request.target == atoms.TARGETS {
            self.send_targets(ctx, request)?;
        } else if request.target == atoms.TIMESTAMP {
            ctx.conn.change_property32(
                request.requestor,
                request.property,
                AtomEnum::INTEGER.into(),
                &[self.timestamp],
            )?;
            send_selection_notify(ctx.conn, request, true)?;
        } else if request.target == atoms.DELETE {
            send_selection_notify(ctx.conn, request, true)?;
        } else {
            match self.start_transfer(ctx, request.target)? {
                Some(fd) => return Ok(RequestOutcome::Transfer(fd)),
                None => send_selection_notify(ctx.conn, request, false)?,
            }
        }
        Ok(RequestOutcome::Replied)
    }

    fn send_targets(
        &self,
        ctx: &BridgeCtx<'_>,
        request: &SelectionRequestEvent,
    ) -> Result<(), XwlError> {
        let mut targets = vec![ctx.atoms.TIMESTAMP, ctx.atoms.TARGETS];
        if let Some(source) = self.source.upgrade() {
            for mime_type in source.mime_types() {
                let atom = atom_for_mime(ctx.conn, ctx.atoms, &mime_type)?;
                if !targets.contains(&atom) {
                    targets.push(atom);
                }
            }
        }
        ctx.conn.change_property32(
            request.requestor,
            request.property,
            AtomEnum::ATOM.into(),
            &targets,
        )?;
        send_selection_notify(ctx.conn, request, true)
    }

    fn start_transfer(
        &self,
        ctx: &BridgeCtx<'_>,
        target: Atom,
    ) -> Result<Option<OwnedFd>, XwlError> {
        let Some(source) = self.source.upgrade() else {
            return Ok(None);
        };
        let mime_types = mime_types_for_atom(ctx.conn, ctx.atoms, target)?;
        let Some(wanted) = mime_types.first() else {
            debug!(target, "Unknown selection target, ignoring request.");
            return Ok(None);
        };

        let offers = source.mime_types();
        let Some(mime_type) = offers.iter().find(|offer| {
            *offer == wanted || (wanted == MIME_URI_LIST && *offer == MIME_X_URI)
        }) else {
            debug!(mime_type = wanted, "Requested mime type is not offered.");
            return Ok(None);
        };

        let (read, write) = pipe_with(PipeFlags::CLOEXEC)?;
        rustix::io::ioctl_fionbio(&read, true)?;
        source.request_data(mime_type, write);
        Ok(Some(read))
    }
}

impl IsAlive for WlSource {
    fn alive(&self) -> bool {
        self.source.strong_count() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetsState {
    Idle,
    Converting,
    Reading(RequestId),
}

/// X11 owned selection, offered to Wayland clients.
#[derive(Debug)]
pub struct X11Source {
    selection: Atom,
    window: Window,
    owner: Window,
    timestamp: Timestamp,
    offers: Vec<Offer>,
    targets: TargetsState,
    stale: bool,
}

impl X11Source {
    pub fn new(selection: Atom, event: &xfixes::SelectionNotifyEvent) -> X11Source {
        X11Source {
            selection,
            window: event.window,
            owner: event.owner,
            timestamp: event.timestamp,
            offers: Vec::new(),
            targets: TargetsState::Idle,
            stale: false,
        }
    }

    pub fn owner(&self) -> Window {
        self.owner
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    pub fn set_offers(&mut self, offers: Vec<Offer>) {
        self.offers = offers;
    }

    pub fn mime_types(&self) -> Vec<String> {
        self.offers
            .iter()
            .map(|offer| offer.mime_type.clone())
            .collect()
    }

    /// Another client took over the selection, no new transfers may be started.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Asks the owner for its targets, the answer arrives as `SelectionNotify`.
    pub fn get_targets(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        ctx.conn.convert_selection(
            self.window,
            self.selection,
            ctx.atoms.TARGETS,
            ctx.atoms.WL_SELECTION,
            self.timestamp,
        )?;
        ctx.conn.flush()?;
        self.targets = TargetsState::Converting;
        Ok(())
    }

    pub fn handle_selection_notify(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &SelectionNotifyEvent,
    ) -> Result<bool, XwlError> {
        if event.requestor != self.window || event.selection != self.selection {
            return Ok(false);
        }
        if event.target != ctx.atoms.TARGETS {
            return Ok(false);
        }
        if event.property == NONE {
            warn!(owner = self.owner, "Incoming X selection conversion failed.");
            self.targets = TargetsState::Idle;
            return Ok(true);
        }

        let id = RequestId::next();
        ctx.conn.get_property(PropertyRequest {
            id,
            window: self.window,
            property: event.property,
            type_: AtomEnum::ANY.into(),
            delete: true,
            long_length: 4096,
        })?;
        self.targets = TargetsState::Reading(id);
        Ok(true)
    }

    pub fn owns_request(&self, id: RequestId) -> bool {
        self.targets == TargetsState::Reading(id)
    }

    /// Processes the targets property. Returns whether the offers were updated.
    pub fn handle_targets_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        reply: Option<GetPropertyReply>,
    ) -> Result<bool, XwlError> {
        self.targets = TargetsState::Idle;
        let Some(reply) = reply else {
            debug!("Failed to get selection targets.");
            return Ok(false);
        };
        if reply.type_ != u32::from(AtomEnum::ATOM) {
            debug!(type_ = reply.type_, "Wrong targets reply type.");
            return Ok(false);
        }
        let Some(targets) = reply.value32() else {
            debug!(format = reply.format, "Wrong targets reply format.");
            return Ok(false);
        };

        let targets = targets.collect::<Vec<_>>();
        self.offers = offers_from_targets(ctx, &targets)?;
        Ok(true)
    }

    /// Target atom to convert the selection to for `mime_type`.
    pub fn target_for(&self, mime_type: &str) -> Option<Atom> {
        if self.stale {
            debug!(mime_type, "Selection owner is gone, refusing transfer.");
            return None;
        }
        self.offers
            .iter()
            .find(|offer| offer.mime_type == mime_type)
            .map(|offer| offer.atom)
    }
}
