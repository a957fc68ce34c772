// SPDX-License-Identifier: GPL-3.0-only

//! Moving selection data between Wayland pipes and X11 properties.
//!
//! Both directions follow ICCCM: data that does not fit into a single chunk
//! is sent with the INCR mechanism, one property at a time.

use std::{
    collections::VecDeque,
    mem,
    os::fd::OwnedFd,
    time::{Duration, Instant},
};

use rustix::io::Errno;
use smithay::utils::{Logical, Point, Size};
use tracing::{debug, trace, warn};
use x11rb::{
    protocol::xproto::{
        Atom, AtomEnum, EventMask, GetPropertyReply, Property, PropertyNotifyEvent,
        SelectionNotifyEvent, SelectionRequestEvent, Timestamp, Window, WindowClass,
    },
    NONE,
};

use super::{
    conn::{PropertyRequest, RequestId, XwlError},
    selection::send_selection_notify,
    BridgeCtx,
};

/// Wayland data flowing to an X11 requestor.
#[derive(Debug)]
pub struct TransferWlToX {
    request: SelectionRequestEvent,
    fd: Option<OwnedFd>,
    chunk_size: usize,
    scratch: Vec<u8>,
    pending: Vec<u8>,
    chunks: VecDeque<Vec<u8>>,
    incr: bool,
    property_set: bool,
    notified: bool,
    last_activity: Instant,
    finished: bool,
}

impl TransferWlToX {
    pub fn new(
        ctx: &BridgeCtx<'_>,
        request: SelectionRequestEvent,
        fd: OwnedFd,
        now: Instant,
    ) -> TransferWlToX {
        let chunk_size = ctx.config.incr_chunk_size();
        TransferWlToX {
            request,
            fd: Some(fd),
            chunk_size,
            scratch: vec![0; chunk_size],
            pending: Vec::new(),
            chunks: VecDeque::new(),
            incr: false,
            property_set: false,
            notified: false,
            last_activity: now,
            finished: false,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.request.time
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[cfg(test)]
    pub fn is_incr(&self) -> bool {
        self.incr
    }

    /// Reads whatever the Wayland client has written so far.
    pub fn refresh(&mut self, ctx: &BridgeCtx<'_>, now: Instant) -> Result<(), XwlError> {
        if self.finished {
            return Ok(());
        }
        let mut eof = false;
        let mut go_incr = false;
        let mut error = None;
        if let Some(fd) = self.fd.as_ref() {
            loop {
                // do not buffer more than the next chunk ahead of the requestor
                if (self.incr || go_incr) && self.chunks.len() > 1 {
                    break;
                }
                let available = self.chunk_size - self.pending.len();
                match rustix::io::read(fd, &mut self.scratch[..available]) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(len) => {
                        self.last_activity = now;
                        self.pending.extend_from_slice(&self.scratch[..len]);
                        if self.pending.len() == self.chunk_size {
                            self.chunks.push_back(mem::take(&mut self.pending));
                            go_incr = !self.incr;
                        }
                    }
                    Err(Errno::AGAIN) => break,
                    Err(Errno::INTR) => continue,
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(err) = error {
            warn!(?err, "Error reading Wayland selection data.");
            self.end(ctx)?;
            return Err(err.into());
        }
        if go_incr {
            self.start_incr(ctx)?;
        }
        if eof {
            self.fd = None;
            if !self.incr {
                // everything fits into a single property
                let data = mem::take(&mut self.pending);
                ctx.conn.change_property8(
                    self.request.requestor,
                    self.request.property,
                    self.request.target,
                    &data,
                )?;
                self.notify(ctx, true)?;
                self.end(ctx)?;
                return Ok(());
            }
            if !self.pending.is_empty() {
                self.chunks.push_back(mem::take(&mut self.pending));
            }
        }
        if self.incr && !self.property_set {
            self.flush_chunk(ctx)?;
        }
        Ok(())
    }

    fn start_incr(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        trace!(requestor = self.request.requestor, "Starting INCR transfer.");
        self.incr = true;
        ctx.conn
            .select_window_events(self.request.requestor, EventMask::PROPERTY_CHANGE)?;
        ctx.conn.change_property32(
            self.request.requestor,
            self.request.property,
            ctx.atoms.INCR,
            &[self.chunk_size as u32],
        )?;
        self.property_set = true;
        // the first chunk goes out once the requestor deletes the INCR property
        self.notify(ctx, true)
    }

    /// Writes the next chunk, or the zero length property ending the transfer.
    fn flush_chunk(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        if let Some(chunk) = self.chunks.pop_front() {
            ctx.conn.change_property8(
                self.request.requestor,
                self.request.property,
                self.request.target,
                &chunk,
            )?;
            ctx.conn.flush()?;
            self.property_set = true;
        } else if self.fd.is_none() {
            ctx.conn.change_property8(
                self.request.requestor,
                self.request.property,
                self.request.target,
                &[],
            )?;
            self.end(ctx)?;
        }
        Ok(())
    }

    pub fn handle_property_notify(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &PropertyNotifyEvent,
        now: Instant,
    ) -> Result<bool, XwlError> {
        if self.finished
            || event.window != self.request.requestor
            || event.atom != self.request.property
        {
            return Ok(false);
        }
        if event.state != Property::DELETE || !self.incr {
            return Ok(true);
        }
        self.last_activity = now;
        self.property_set = false;
        self.flush_chunk(ctx)?;
        Ok(true)
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn notify(&mut self, ctx: &BridgeCtx<'_>, success: bool) -> Result<(), XwlError> {
        if !self.notified {
            self.notified = true;
            send_selection_notify(ctx.conn, &self.request, success)?;
        }
        Ok(())
    }

    /// Ends the transfer, refusing the request if it was never answered.
    pub fn end(&mut self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.fd = None;
        self.notify(ctx, false)?;
        if self.incr {
            ctx.conn
                .select_window_events(self.request.requestor, EventMask::NO_EVENT)?;
        }
        ctx.conn.flush()
    }
}

/// Post-processing of the data of some targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Plain,
    /// `_NETSCAPE_URL`: every other line is a title
    NetscapeUrl,
    /// `text/x-moz-url`: like netscape urls, but UTF-16
    MozUrl,
}

impl TargetFormat {
    pub fn for_target(ctx: &BridgeCtx<'_>, target: Atom) -> TargetFormat {
        if target == ctx.atoms.NETSCAPE_URL {
            TargetFormat::NetscapeUrl
        } else if target == ctx.atoms.MOZ_URL {
            TargetFormat::MozUrl
        } else {
            TargetFormat::Plain
        }
    }

    pub fn convert(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            TargetFormat::Plain => data,
            TargetFormat::NetscapeUrl => {
                if !data.contains(&b'\n') {
                    return data;
                }
                data.split(|byte| *byte == b'\n')
                    .step_by(2)
                    .collect::<Vec<_>>()
                    .join(&b'\n')
            }
            TargetFormat::MozUrl => {
                let units = data
                    .chunks_exact(2)
                    .map(|unit| u16::from_ne_bytes([unit[0], unit[1]]))
                    .collect::<Vec<_>>();
                let text = String::from_utf16_lossy(&units);
                text.trim_end_matches('\0')
                    .split('\n')
                    .step_by(2)
                    .collect::<Vec<_>>()
                    .join("\n")
                    .into_bytes()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    /// Waiting for the owner to answer `ConvertSelection`.
    Converting,
    Reading(RequestId),
    /// INCR: waiting for the owner to write the next chunk.
    AwaitingChunk,
    ReadingChunk(RequestId),
    Writing,
}

/// X11 selection data flowing to a Wayland client.
#[derive(Debug)]
pub struct TransferXToWl {
    selection: Atom,
    target: Atom,
    window: Window,
    timestamp: Timestamp,
    fd: Option<OwnedFd>,
    format: TargetFormat,
    state: ReceiveState,
    incr: bool,
    buffer: Vec<u8>,
    written: usize,
    last_activity: Instant,
    finished: bool,
}

impl TransferXToWl {
    /// Creates a requestor window below `parent` and asks the owner to convert the selection.
    pub fn new(
        ctx: &BridgeCtx<'_>,
        selection: Atom,
        target: Atom,
        fd: OwnedFd,
        timestamp: Timestamp,
        parent: Window,
        now: Instant,
    ) -> Result<TransferXToWl, XwlError> {
        rustix::io::ioctl_fionbio(&fd, true)?;
        let window = ctx.conn.create_window(
            parent,
            Point::<i32, Logical>::from((0, 0)),
            Size::<i32, Logical>::from((1, 1)),
            WindowClass::INPUT_ONLY,
            EventMask::PROPERTY_CHANGE,
        )?;
        ctx.conn
            .convert_selection(window, selection, target, ctx.atoms.WL_SELECTION, timestamp)?;
        ctx.conn.flush()?;

        Ok(TransferXToWl {
            selection,
            target,
            window,
            timestamp,
            fd: Some(fd),
            format: TargetFormat::for_target(ctx, target),
            state: ReceiveState::Converting,
            incr: false,
            buffer: Vec::new(),
            written: 0,
            last_activity: now,
            finished: false,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[cfg(test)]
    pub fn window(&self) -> Window {
        self.window
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle_selection_notify(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &SelectionNotifyEvent,
    ) -> Result<bool, XwlError> {
        if event.requestor != self.window || event.selection != self.selection {
            return Ok(false);
        }
        if event.property == NONE {
            warn!(target = self.target, "Incoming X selection conversion failed.");
            self.end();
            return Ok(true);
        }
        if event.target == ctx.atoms.TARGETS {
            warn!("Received targets too late.");
            return Ok(true);
        }
        if self.state != ReceiveState::Converting {
            debug!("Ignoring repeated SelectionNotify.");
            return Ok(true);
        }

        let id = self.read_property(ctx, true)?;
        self.state = ReceiveState::Reading(id);
        Ok(true)
    }

    fn read_property(&self, ctx: &BridgeCtx<'_>, delete: bool) -> Result<RequestId, XwlError> {
        let id = RequestId::next();
        ctx.conn.get_property(PropertyRequest {
            id,
            window: self.window,
            property: ctx.atoms.WL_SELECTION,
            type_: AtomEnum::ANY.into(),
            delete,
            long_length: 0x1fffffff,
        })?;
        Ok(id)
    }

    pub fn owns_request(&self, id: RequestId) -> bool {
        matches!(
            self.state,
            ReceiveState::Reading(pending) | ReceiveState::ReadingChunk(pending) if pending == id
        )
    }

    pub fn handle_property_reply(
        &mut self,
        ctx: &BridgeCtx<'_>,
        reply: Option<GetPropertyReply>,
        now: Instant,
    ) -> Result<(), XwlError> {
        let Some(reply) = reply else {
            warn!("Can't get selection property.");
            self.end();
            return Ok(());
        };
        self.last_activity = now;

        if self.state == ReceiveState::AwaitingChunk || self.state == ReceiveState::Writing {
            return Ok(());
        }
        let first = matches!(self.state, ReceiveState::Reading(_));
        if first && reply.type_ == ctx.atoms.INCR {
            // deleting the property told the owner to start sending chunks
            self.incr = true;
            self.state = ReceiveState::AwaitingChunk;
            return Ok(());
        }
        if !first && reply.value.is_empty() {
            trace!(target = self.target, "INCR transfer complete.");
            ctx.conn.delete_property(self.window, ctx.atoms.WL_SELECTION)?;
            self.end();
            return Ok(());
        }

        self.buffer = self.format.convert(reply.value);
        self.written = 0;
        self.state = ReceiveState::Writing;
        self.write_buffer(ctx, now)
    }

    pub fn handle_property_notify(
        &mut self,
        ctx: &BridgeCtx<'_>,
        event: &PropertyNotifyEvent,
    ) -> Result<bool, XwlError> {
        if event.window != self.window {
            return Ok(false);
        }
        if event.state == Property::NEW_VALUE
            && event.atom == ctx.atoms.WL_SELECTION
            && self.incr
            && self.state == ReceiveState::AwaitingChunk
        {
            let id = self.read_property(ctx, false)?;
            self.state = ReceiveState::ReadingChunk(id);
        }
        Ok(true)
    }

    /// Continues writing buffered data into the Wayland pipe.
    pub fn refresh(&mut self, ctx: &BridgeCtx<'_>, now: Instant) -> Result<(), XwlError> {
        if self.state == ReceiveState::Writing {
            self.write_buffer(ctx, now)?;
        }
        Ok(())
    }

    fn write_buffer(&mut self, ctx: &BridgeCtx<'_>, now: Instant) -> Result<(), XwlError> {
        let Some(fd) = self.fd.as_ref() else {
            return Ok(());
        };
        while self.written < self.buffer.len() {
            match rustix::io::write(fd, &self.buffer[self.written..]) {
                Ok(len) => {
                    self.written += len;
                    self.last_activity = now;
                }
                Err(Errno::AGAIN) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(err) => {
                    warn!(?err, "Error writing to Wayland pipe.");
                    self.end();
                    return Err(err.into());
                }
            }
        }

        self.buffer.clear();
        self.written = 0;
        if self.incr {
            // ask for the next chunk
            ctx.conn.delete_property(self.window, ctx.atoms.WL_SELECTION)?;
            ctx.conn.flush()?;
            self.state = ReceiveState::AwaitingChunk;
        } else {
            self.end();
        }
        Ok(())
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    pub fn end(&mut self) {
        self.finished = true;
        // closing the pipe signals the end of data to the client
        self.fd = None;
    }

    pub fn destroy(self, ctx: &BridgeCtx<'_>) -> Result<(), XwlError> {
        ctx.conn.destroy_window(self.window)?;
        ctx.conn.flush()
    }
}
