// SPDX-License-Identifier: GPL-3.0-only
// Shared types for capture sources

//! Shared types for capture sources

use crate::errors::DeviceError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single captured frame
///
/// Pixels are always RGBA (4 bytes per pixel); rows may carry padding, so
/// index through `stride`. Frames are shared as `Arc<Frame>` between the
/// buffer, the compositor and the inference client and are never mutated.
#[derive(Clone)]
pub struct Frame {
    /// Monotonically increasing per capture handle, starting at 1
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, `>= width * 4`
    pub stride: u32,
    pub data: Arc<[u8]>,
    /// Monotonic capture instant (for latency measurements)
    pub captured_at: Instant,
    /// Wall-clock capture time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl Frame {
    /// Build a tightly packed RGBA frame captured now
    pub fn from_rgba(sequence: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            sequence,
            width,
            height,
            stride: width * 4,
            data: Arc::from(data),
            captured_at: Instant::now(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build a frame filled with a single color (placeholders, tests)
    pub fn solid(sequence: u64, width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::from_rgba(sequence, width, height, data)
    }

    /// RGBA value at (x, y), clamped to the frame edges
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        if self.width == 0 || self.height == 0 {
            return [0, 0, 0, 0];
        }
        let x = x.min(self.width - 1) as usize;
        let y = y.min(self.height - 1) as usize;
        let idx = y * self.stride as usize + x * 4;
        match self.data.get(idx..idx + 4) {
            Some(px) => [px[0], px[1], px[2], px[3]],
            None => [0, 0, 0, 0],
        }
    }

    /// Copy pixel data into a tightly packed image (drops stride padding)
    pub fn to_rgba_image(&self) -> image::RgbaImage {
        let width = self.width as usize;
        let stride = self.stride as usize;
        let mut packed = Vec::with_capacity(width * self.height as usize * 4);

        for y in 0..self.height as usize {
            let row_start = y * stride;
            let row_end = row_start + width * 4;
            match self.data.get(row_start..row_end) {
                Some(row) => packed.extend_from_slice(row),
                None => packed.resize(packed.len() + width * 4, 0),
            }
        }

        image::RgbaImage::from_raw(self.width, self.height, packed)
            .unwrap_or_else(|| image::RgbaImage::new(self.width, self.height))
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("bytes", &self.data.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

/// Hands out sequence numbers for one capture handle
#[derive(Debug)]
pub struct FrameSequencer {
    next: u64,
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Stamp freshly captured RGBA data with the next sequence number
    pub fn stamp(&mut self, width: u32, height: u32, stride: u32, data: Arc<[u8]>) -> Frame {
        let sequence = self.next;
        self.next += 1;
        Frame {
            sequence,
            width,
            height,
            stride,
            data,
            captured_at: Instant::now(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Number of frames stamped so far
    pub fn issued(&self) -> u64 {
        self.next - 1
    }
}

/// Framerate as a fraction (numerator/denominator)
/// Stores exact framerate to handle NTSC rates like 59.94fps (60000/1001)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Framerate {
    pub num: u32,
    pub denom: u32,
}

impl Framerate {
    pub fn new(num: u32, denom: u32) -> Self {
        Self {
            num,
            denom: if denom == 0 { 1 } else { denom },
        }
    }

    pub fn from_int(fps: u32) -> Self {
        Self { num: fps, denom: 1 }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.denom as f64
    }

    /// Time between two frames
    pub fn frame_interval(&self) -> Duration {
        if self.num == 0 {
            return Duration::from_secs(1);
        }
        Duration::from_nanos(1_000_000_000 * self.denom as u64 / self.num as u64)
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.denom != 1 {
            write!(f, "{:.2}", self.as_f64())
        } else {
            write!(f, "{}", self.num)
        }
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self { num: 30, denom: 1 }
    }
}

/// Requested capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
}

impl CaptureFormat {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            framerate: Framerate::from_int(fps),
        }
    }
}

impl std::fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} @ {}fps", self.width, self.height, self.framerate)
    }
}

/// Device information from V4L2 capability
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    /// Device path (e.g., /dev/video0)
    pub path: String,
    /// Name of the device (V4L2 card)
    pub card: String,
    /// Driver name (V4L2 driver)
    pub driver: String,
}

/// What a capture handle delivers
#[derive(Debug)]
pub enum CaptureEvent {
    /// Next frame in capture order
    Frame(Frame),
    /// The device failed; no frames follow
    Lost(DeviceError),
}
