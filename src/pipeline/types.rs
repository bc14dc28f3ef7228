// SPDX-License-Identifier: MPL-2.0

//! Detection result types
//!
//! These are what inference produces and what the compositor draws. Boxes
//! are normalized so they survive any downscaling a backend does.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A rectangular region within a frame
///
/// Coordinates are normalized (0.0 to 1.0) relative to the frame dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge (0.0 = left of frame, 1.0 = right of frame)
    pub x: f32,
    /// Top edge (0.0 = top of frame, 1.0 = bottom of frame)
    pub y: f32,
    /// Width as fraction of frame width
    pub width: f32,
    /// Height as fraction of frame height
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a bounding box from pixel coordinates
    pub fn from_pixels(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let fw = frame_width.max(1) as f32;
        let fh = frame_height.max(1) as f32;
        Self {
            x: x as f32 / fw,
            y: y as f32 / fh,
            width: width as f32 / fw,
            height: height as f32 / fh,
        }
    }

    /// Pixel rectangle (x, y, width, height) clamped to the frame
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> (u32, u32, u32, u32) {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x0 = (self.x * fw).round().clamp(0.0, fw) as u32;
        let y0 = (self.y * fh).round().clamp(0.0, fh) as u32;
        let x1 = ((self.x + self.width) * fw).round().clamp(0.0, fw) as u32;
        let y1 = ((self.y + self.height) * fh).round().clamp(0.0, fh) as u32;
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    /// Finite, non-negative and inside the unit square
    pub fn is_valid(&self) -> bool {
        const EPSILON: f32 = 1e-4;
        let values = [self.x, self.y, self.width, self.height];
        values.iter().all(|v| v.is_finite() && *v >= 0.0)
            && self.x + self.width <= 1.0 + EPSILON
            && self.y + self.height <= 1.0 + EPSILON
    }
}

/// One object found in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl DetectedObject {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// Reason this object is malformed, if it is
    pub fn validation_error(&self) -> Option<String> {
        if self.label.trim().is_empty() {
            return Some("empty label".to_string());
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Some(format!(
                "confidence {} for '{}' is outside 0..=1",
                self.confidence, self.label
            ));
        }
        if !self.bbox.is_valid() {
            return Some(format!(
                "bounding box {:?} for '{}' is outside the frame",
                self.bbox, self.label
            ));
        }
        None
    }
}

/// Inference result for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Sequence number of the frame this was computed from
    pub sequence: u64,
    pub objects: Vec<DetectedObject>,
    /// Submission to completion, including retries
    pub latency: Duration,
    /// Attempts used (1 when the first try succeeded)
    pub attempts: u32,
}

impl Detection {
    /// Highest-confidence object, if any
    pub fn top_object(&self) -> Option<&DetectedObject> {
        self.objects
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
