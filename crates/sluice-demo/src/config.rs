//! Demo settings
//!
//! Read from `$XDG_CONFIG_HOME/sluice/config.toml`. A missing file is seeded
//! with the defaults so there is something to edit next time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sluice::StreamOptions;
use sluice_ipc::PixelFormat;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "sluice/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamOptions,
    pub demo: DemoConfig,
}

impl Config {
    /// Settings from the user's config directory
    pub fn load() -> Result<Self> {
        let path = dirs::config_dir()
            .context("No config directory for this user")?
            .join(CONFIG_FILE);
        Self::load_from(&path)
    }

    /// Settings from `path`; defaults (written back to `path`) when absent
    fn load_from(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                match Self::default().write_to(path) {
                    Ok(()) => info!("Wrote default settings to {}", path.display()),
                    Err(e) => warn!("Could not seed {}: {:#}", path.display(), e),
                }
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        let config =
            Self::parse(&text).with_context(|| format!("Bad settings in {}", path.display()))?;
        debug!("Demo settings from {}: {:?}", path.display(), config);
        Ok(config)
    }

    fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// How the loopback server hands buffers back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Server owns the pool and returns a different buffer per submit
    #[default]
    PingPong,
    /// Client allocates; the server returns each buffer when done with it
    Vault,
}

/// Demo run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Frames to render before exiting
    pub frames: u32,
    pub protocol: Protocol,
    /// Simulated composition time per submitted buffer
    pub server_latency_ms: u64,
    pub swap_interval: i32,
    pub pixel_format: PixelFormat,
    /// Seconds between FPS reports
    pub report_interval_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 300,
            protocol: Protocol::PingPong,
            server_latency_ms: 4,
            swap_interval: 1,
            pixel_format: PixelFormat::Argb8888,
            report_interval_secs: 1,
        }
    }
}
