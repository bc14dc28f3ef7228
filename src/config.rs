// SPDX-License-Identifier: GPL-3.0-only

//! User configuration
//!
//! Loaded from `$XDG_CONFIG_HOME/vision-monitor/config.json` (or an explicit
//! path). Every field has a default, so partial files are accepted.

use crate::constants::{self, capture, inference, overlay};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Where frames come from
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    /// Built-in moving test pattern
    #[default]
    Synthetic,
    /// Video4Linux2 capture device
    V4l2 {
        /// Device node, e.g. `/dev/video0`
        device: String,
    },
}

/// Which detector answers inference requests
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorSettings {
    /// In-process bright-region detector
    Threshold {
        /// Pixels with luma at or above this value count as foreground
        luma_threshold: u8,
    },
    /// External detector process speaking JSON lines over stdio
    Process {
        /// Executable to spawn
        command: String,
        /// Arguments passed to the executable
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::Threshold {
            luma_threshold: inference::DEFAULT_LUMA_THRESHOLD,
        }
    }
}

/// Capture settings
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceSettings,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            width: capture::DEFAULT_WIDTH,
            height: capture::DEFAULT_HEIGHT,
            framerate: capture::DEFAULT_FRAMERATE,
        }
    }
}

/// Inference request and retry settings
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub detector: DetectorSettings,
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,
    /// Total attempts per request (first try included)
    pub retry_budget: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Randomized fraction of each backoff delay (0.0 - 1.0)
    pub jitter: f64,
    /// Minimum spacing between submissions while running (0 = as fast as the backend allows)
    pub min_interval_ms: u64,
    /// Minimum spacing between submissions while degraded
    pub degraded_probe_interval_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            detector: DetectorSettings::default(),
            timeout_ms: inference::DEFAULT_TIMEOUT.as_millis() as u64,
            retry_budget: inference::DEFAULT_RETRY_BUDGET,
            backoff_base_ms: inference::DEFAULT_BACKOFF_BASE.as_millis() as u64,
            backoff_max_ms: inference::DEFAULT_BACKOFF_MAX.as_millis() as u64,
            jitter: inference::DEFAULT_JITTER,
            min_interval_ms: 0,
            degraded_probe_interval_ms: inference::DEFAULT_DEGRADED_PROBE_INTERVAL.as_millis()
                as u64,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn degraded_probe_interval(&self) -> Duration {
        Duration::from_millis(self.degraded_probe_interval_ms)
    }
}

/// Overlay drawing settings
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Max sequence-number gap between a frame and the detection drawn on it
    pub max_staleness: u64,
    /// Objects below this confidence are not drawn
    pub min_confidence: f32,
    /// Box color as `#RRGGBB` or `#RRGGBBAA`
    pub color: String,
    /// Box outline thickness in pixels
    pub line_width: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        let [r, g, b, _] = overlay::DEFAULT_COLOR;
        Self {
            max_staleness: overlay::DEFAULT_MAX_STALENESS,
            min_confidence: overlay::DEFAULT_MIN_CONFIDENCE,
            color: format!("#{:02X}{:02X}{:02X}", r, g, b),
            line_width: overlay::DEFAULT_LINE_WIDTH,
        }
    }
}

impl OverlayConfig {
    /// Parse the configured color into RGBA
    pub fn color_rgba(&self) -> Result<[u8; 4], ConfigError> {
        parse_hex_color(&self.color)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub inference: InferenceConfig,
    pub overlay: OverlayConfig,
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(constants::APP_NAME)
                .join(constants::CONFIG_FILE_NAME)
        })
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from an explicit path, else the default location if it exists, else defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size {}x{} must be non-zero",
                capture.width, capture.height
            )));
        }
        if capture.width > capture::MAX_DIMENSION || capture.height > capture::MAX_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "capture size {}x{} exceeds {}x{}",
                capture.width,
                capture.height,
                capture::MAX_DIMENSION,
                capture::MAX_DIMENSION
            )));
        }
        if !(1..=240).contains(&capture.framerate) {
            return Err(ConfigError::Invalid(format!(
                "framerate {} must be between 1 and 240",
                capture.framerate
            )));
        }
        if let SourceSettings::V4l2 { device } = &capture.source
            && device.trim().is_empty()
        {
            return Err(ConfigError::Invalid("v4l2 device path is empty".into()));
        }

        let inference = &self.inference;
        if inference.timeout_ms == 0 {
            return Err(ConfigError::Invalid("inference timeout must be non-zero".into()));
        }
        if inference.retry_budget == 0 {
            return Err(ConfigError::Invalid(
                "retry budget must allow at least one attempt".into(),
            ));
        }
        if inference.backoff_base_ms > inference.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base {} ms exceeds max {} ms",
                inference.backoff_base_ms, inference.backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&inference.jitter) {
            return Err(ConfigError::Invalid(format!(
                "jitter {} must be between 0.0 and 1.0",
                inference.jitter
            )));
        }
        if let DetectorSettings::Process { command, .. } = &inference.detector
            && command.trim().is_empty()
        {
            return Err(ConfigError::Invalid("detector command is empty".into()));
        }

        let overlay = &self.overlay;
        if !(0.0..=1.0).contains(&overlay.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_confidence {} must be between 0.0 and 1.0",
                overlay.min_confidence
            )));
        }
        if overlay.line_width == 0 {
            return Err(ConfigError::Invalid("line_width must be non-zero".into()));
        }
        overlay.color_rgba()?;

        Ok(())
    }
}

/// Parse `#RRGGBB` / `#RRGGBBAA` (leading `#` optional)
pub fn parse_hex_color(value: &str) -> Result<[u8; 4], ConfigError> {
    let hex = value.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return Err(ConfigError::Invalid(format!("bad color {:?}", value)));
    }

    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| ConfigError::Invalid(format!("bad color {:?}", value)))
    };

    let alpha = if hex.len() == 8 { channel(6)? } else { 0xFF };
    Ok([channel(0)?, channel(2)?, channel(4)?, alpha])
}
