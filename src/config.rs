//! Configuration management for the visualizer
//!
//! Options are loaded from a JSON file at startup so thresholds, fade timing
//! and the MIDI source endpoint can be tuned without recompilation. Keys use
//! the camelCase option names the browser client exposes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default MIDI event source endpoint
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8765";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub visualizer: VisualizerConfig,
    pub channel: ChannelConfig,
    pub surface: SurfaceConfig,
}

/// Coordinator options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VisualizerConfig {
    /// Enables the periodic performance report
    pub enable_performance_monitoring: bool,
    /// Frame rate the frame-drop threshold is derived from
    #[serde(rename = "targetFPS")]
    pub target_fps: f64,
    /// High-latency threshold in milliseconds
    pub max_latency: f64,
    /// Delay between note-off and visual key release in milliseconds
    pub fade_out_time: f64,
    /// Passed through to the renderer's intensity calculation
    pub enable_velocity_mapping: bool,
    /// Fade-out on release instead of an immediate key-up
    pub enable_smooth_transitions: bool,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            enable_performance_monitoring: true,
            target_fps: 60.0,
            max_latency: 50.0,
            fade_out_time: 500.0,
            enable_velocity_mapping: true,
            enable_smooth_transitions: true,
        }
    }
}

/// Connection channel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// WebSocket endpoint of the MIDI event source
    pub url: String,
    /// Reconnect attempts before the channel gives up
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay in milliseconds, doubled per attempt
    pub reconnect_delay: u64,
    /// Capacity of the latency sample ring
    pub latency_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay: 1000,
            latency_window: 100,
        }
    }
}

impl ChannelConfig {
    /// Check the endpoint looks like a WebSocket URL with a host.
    pub fn validate_endpoint(&self) -> Result<(), String> {
        let rest = self
            .url
            .strip_prefix("ws://")
            .or_else(|| self.url.strip_prefix("wss://"))
            .ok_or_else(|| format!("unsupported scheme in {:?}", self.url))?;

        let host = rest.split(['/', '?']).next().unwrap_or_default();
        if host.is_empty() || host.starts_with(':') {
            return Err(format!("missing host in {:?}", self.url));
        }
        Ok(())
    }
}

/// Initial rendering surface size
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The parsed configuration, or defaults when the file is missing or invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default asset location
    pub fn load() -> Self {
        Self::load_from_file("assets/keyglow_config.json")
    }

    /// Report the first option that cannot be used as-is.
    pub fn validate(&self) -> Result<(), String> {
        self.channel.validate_endpoint()?;
        if self.channel.latency_window == 0 {
            return Err("latencyWindow must be at least 1".to_string());
        }
        if !(self.visualizer.target_fps.is_finite() && self.visualizer.target_fps > 0.0) {
            return Err(format!(
                "targetFPS must be positive, got {}",
                self.visualizer.target_fps
            ));
        }
        if self.visualizer.fade_out_time < 0.0 {
            return Err(format!(
                "fadeOutTime must not be negative, got {}",
                self.visualizer.fade_out_time
            ));
        }
        if self.surface.width == 0 || self.surface.height == 0 {
            return Err(format!(
                "surface must be non-empty, got {}x{}",
                self.surface.width, self.surface.height
            ));
        }
        Ok(())
    }
}
