// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber.
///
/// Logs go to stderr and, if available, to the systemd journal.
/// `RUST_LOG` overrides the default filter.
pub fn init_logger() -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(if cfg!(debug_assertions) { "warn" } else { "error" })
            .add_directive(
                if cfg!(debug_assertions) {
                    "cosmic_xwl_bridge=debug"
                } else {
                    "cosmic_xwl_bridge=info"
                }
                .parse()?,
            ),
    };
    let fmt_layer = fmt::layer().compact();

    match tracing_journald::layer() {
        Ok(journald_layer) => tracing_subscriber::registry()
            .with(fmt_layer)
            .with(journald_layer)
            .with(filter)
            .try_init()?,
        Err(err) => {
            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(filter)
                .try_init()?;
            warn!(?err, "Failed to init journald logging.");
        }
    };
    log_panics::init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    Ok(())
}
