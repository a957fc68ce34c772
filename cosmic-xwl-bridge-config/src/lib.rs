// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest XDND protocol version the bridge speaks.
pub const MAX_XDND_VERSION: u32 = 5;

/// Settings of the X11 <-> Wayland selection bridge.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge the CLIPBOARD selection
    pub clipboard: bool,
    /// Bridge the PRIMARY selection
    pub primary_selection: bool,
    /// Bridge drag-and-drop through XdndSelection
    pub drag_and_drop: bool,
    /// Only let X11 clients read Wayland selections while an X11 window is active
    pub focus_gated_selection: bool,
    /// Maximum XDND version announced to X11 clients
    pub xdnd_version: u32,
    /// Size of a single INCR chunk in bytes, also the INCR threshold
    pub incr_chunk_size: u32,
    pub transfer_timeout_ms: u64,
    pub drop_grace_period_ms: u64,
    pub refresh_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> BridgeConfig {
        BridgeConfig {
            clipboard: true,
            primary_selection: true,
            drag_and_drop: true,
            focus_gated_selection: true,
            xdnd_version: MAX_XDND_VERSION,
            incr_chunk_size: 63 * 1024,
            transfer_timeout_ms: 5000,
            drop_grace_period_ms: 2000,
            refresh_interval_ms: 20,
        }
    }
}

impl BridgeConfig {
    /// XDND version clamped to what is actually implemented.
    pub fn xdnd_version(&self) -> u32 {
        self.xdnd_version.clamp(1, MAX_XDND_VERSION)
    }

    pub fn incr_chunk_size(&self) -> usize {
        // an empty chunk would end every INCR transfer right away
        self.incr_chunk_size.max(1) as usize
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn drop_grace_period(&self) -> Duration {
        Duration::from_millis(self.drop_grace_period_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}
