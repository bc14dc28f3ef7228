// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Capture defaults
pub mod capture {
    /// Default capture width in pixels
    pub const DEFAULT_WIDTH: u32 = 640;
    /// Default capture height in pixels
    pub const DEFAULT_HEIGHT: u32 = 480;
    /// Default capture framerate
    pub const DEFAULT_FRAMERATE: u32 = 30;
    /// Largest accepted capture width or height in pixels
    pub const MAX_DIMENSION: u32 = 8192;
    /// Number of V4L2 mmap buffers
    pub const V4L2_BUFFER_COUNT: u32 = 4;
    /// Log every Nth frame at debug level
    pub const LOG_EVERY_N_FRAMES: u64 = 60;
}

/// Inference defaults
pub mod inference {
    use super::Duration;

    /// Per-attempt timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_000);
    /// Total attempts per request before the pipeline degrades
    pub const DEFAULT_RETRY_BUDGET: u32 = 3;
    /// First backoff delay
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
    /// Upper bound for a single backoff delay
    pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(2_000);
    /// Fraction of each backoff delay that is randomized (0.0 - 1.0)
    pub const DEFAULT_JITTER: f64 = 0.5;
    /// Minimum spacing between submissions while degraded
    pub const DEFAULT_DEGRADED_PROBE_INTERVAL: Duration = Duration::from_millis(1_000);
    /// Default luminance threshold for the built-in detector
    pub const DEFAULT_LUMA_THRESHOLD: u8 = 200;
    /// Frames are downscaled to this size before the built-in detector runs
    pub const DETECTOR_MAX_DIMENSION: u32 = 320;
}

/// Overlay defaults
pub mod overlay {
    /// Max sequence-number gap between a frame and the detection drawn on it
    pub const DEFAULT_MAX_STALENESS: u64 = 5;
    /// Detections below this confidence are not drawn
    pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
    /// Box outline color (#FF7222)
    pub const DEFAULT_COLOR: [u8; 4] = [0xFF, 0x72, 0x22, 0xFF];
    /// Box outline thickness in pixels
    pub const DEFAULT_LINE_WIDTH: u32 = 3;
    /// JPEG quality for snapshots
    pub const JPEG_QUALITY: u8 = 80;
}

/// Status reporting
pub mod status {
    use super::Duration;

    /// Interval between status log lines in headless mode
    pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);
    /// Smoothing factor for the frames-per-second estimate
    pub const FPS_SMOOTHING: f64 = 0.1;
}

/// HTTP delivery
pub mod server {
    /// Default listen address for `serve`
    pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";
    /// Multipart boundary between MJPEG parts
    pub const MJPEG_BOUNDARY: &str = "frame";
}

/// Name used for the config directory and logging
pub const APP_NAME: &str = "vision-monitor";

/// Config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.json";
