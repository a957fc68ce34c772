// SPDX-License-Identifier: GPL-3.0-only

pub use cosmic_xwl_bridge_config::BridgeConfig;
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    File(#[from] std::io::Error),
    #[error("Malformed config file: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bridge: BridgeConfig,
}

impl Config {
    pub fn load() -> Config {
        let xdg = xdg::BaseDirectories::new().ok();
        Config {
            bridge: Self::load_bridge(xdg.as_ref()),
        }
    }

    fn load_bridge(xdg: Option<&xdg::BaseDirectories>) -> BridgeConfig {
        let mut locations = if let Some(base) = xdg {
            vec![
                base.get_config_file("cosmic-xwl-bridge.ron"),
                base.get_config_file("cosmic-xwl-bridge/config.ron"),
            ]
        } else {
            Vec::with_capacity(2)
        };
        locations.push(PathBuf::from("/etc/cosmic-xwl-bridge/config.ron"));
        locations.push(PathBuf::from("/etc/cosmic-xwl-bridge.ron"));

        for path in locations {
            debug!("Trying config location: {}", path.display());
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => {
                        info!("Using config at {}", path.display());
                        return config;
                    }
                    Err(err) => {
                        warn!(?err, "Failed to read {}, skipping.", path.display());
                    }
                }
            }
        }

        BridgeConfig::default()
    }

    pub fn load_from(path: &Path) -> Result<BridgeConfig, ConfigError> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(ron::de::from_reader(file)?)
    }
}
