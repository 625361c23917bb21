//! Configuration management for wlsink
//!
//! This module handles loading, parsing, and validating sink configuration
//! from TOML files, plus the environment overrides the sink has always
//! honoured (`WAYLANDSINK_SYNC_FRAME`, `WAYLANDSINK_STRETCH`).

use crate::buffer::pool::{PoolLimits, MIN_POOL_BUFFERS};
use crate::window::{FillMode, Layer, Rectangle};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable enabling synchronous frame pacing
pub const ENV_SYNC_FRAME: &str = "WAYLANDSINK_SYNC_FRAME";

/// Environment variable making Stretch the default fill mode
pub const ENV_STRETCH: &str = "WAYLANDSINK_STRETCH";

/// Main configuration struct containing all sink settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SinkConfig {
    /// Compositor connection settings
    #[serde(default)]
    pub display: DisplayConfig,

    /// Output window settings
    #[serde(default)]
    pub window: WindowConfig,

    /// Copy pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DisplayConfig {
    /// Wayland display name or socket path; `None` uses `WAYLAND_DISPLAY`
    #[serde(default)]
    pub name: Option<String>,

    /// Block each render until the compositor's frame callback fires
    #[serde(default)]
    pub sync_frame: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    #[serde(default)]
    pub fill_mode: FillMode,

    #[serde(default)]
    pub layer: Layer,

    /// Window opacity (0.0-1.0)
    #[serde(default = "WindowConfig::default_alpha")]
    pub alpha: f64,

    #[serde(default)]
    pub fullscreen: bool,

    /// Initial placement; the window sizes itself to the video when unset
    #[serde(default)]
    pub render_rectangle: Option<Rectangle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_min_buffers")]
    pub min_buffers: usize,

    #[serde(default = "PoolConfig::default_max_buffers")]
    pub max_buffers: usize,

    /// How long a copy waits for the compositor to release a pool buffer
    #[serde(default = "PoolConfig::default_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::default(),
            layer: Layer::default(),
            alpha: Self::default_alpha(),
            fullscreen: false,
            render_rectangle: None,
        }
    }
}

impl WindowConfig {
    fn default_alpha() -> f64 {
        1.0
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_buffers: Self::default_min_buffers(),
            max_buffers: Self::default_max_buffers(),
            release_timeout_ms: Self::default_release_timeout_ms(),
        }
    }
}

impl PoolConfig {
    fn default_min_buffers() -> usize {
        2
    }

    fn default_max_buffers() -> usize {
        4
    }

    fn default_release_timeout_ms() -> u64 {
        500
    }

    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            min_buffers: self.min_buffers,
            max_buffers: self.max_buffers,
            release_timeout: Duration::from_millis(self.release_timeout_ms),
        }
    }
}

impl SinkConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: SinkConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Defaults with the environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Applies `WAYLANDSINK_SYNC_FRAME` and `WAYLANDSINK_STRETCH`
    pub fn apply_env(&mut self) {
        if std::env::var_os(ENV_SYNC_FRAME).is_some() {
            self.display.sync_frame = true;
        }
        if std::env::var_os(ENV_STRETCH).is_some() {
            self.window.fill_mode = FillMode::Stretch;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.window.alpha) {
            anyhow::bail!("Invalid alpha: must be between 0.0 and 1.0");
        }

        if let Some(rect) = &self.window.render_rectangle {
            if rect.width <= 0 || rect.height <= 0 {
                anyhow::bail!("Invalid render_rectangle: width and height must be positive");
            }
        }

        if self.pool.max_buffers < MIN_POOL_BUFFERS {
            anyhow::bail!(
                "Invalid pool: max_buffers must be at least {} (one stays on screen)",
                MIN_POOL_BUFFERS
            );
        }
        if self.pool.min_buffers > self.pool.max_buffers {
            anyhow::bail!(
                "Invalid pool: min_buffers ({}) exceeds max_buffers ({})",
                self.pool.min_buffers,
                self.pool.max_buffers
            );
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod property_tests;
