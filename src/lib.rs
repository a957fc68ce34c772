// SPDX-License-Identifier: GPL-3.0-only

//! Clipboard, primary selection and drag-and-drop between Xwayland clients
//! and a Wayland compositor's seat.
//!
//! The compositor owns an [`xwayland::DataBridge`], feeds it X11 events and
//! seat changes and implements [`xwayland::BridgeHandler`] for the Wayland
//! side of things.

pub mod config;
pub mod logger;
pub mod xwayland;
