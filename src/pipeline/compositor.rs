// SPDX-License-Identifier: GPL-3.0-only

//! Overlay composition
//!
//! Pairs the frame being displayed with the latest accepted detection. A
//! detection is only drawn when it is close enough in sequence space:
//!
//! ```text
//! detection.sequence + max_staleness < frame.sequence  → suppressed (stale)
//! detection.sequence > frame.sequence                   → suppressed (ahead)
//! otherwise                                             → boxes drawn
//! ```
//!
//! `compose` is pure and cheap; rasterizing the boxes is deferred to
//! [`Composite::render`] so surfaces that only need metadata pay nothing.

use crate::backends::camera::types::Frame;
use crate::config::OverlayConfig;
use crate::constants::overlay as defaults;
use crate::errors::ConfigError;
use crate::pipeline::types::{DetectedObject, Detection};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgba, RgbaImage};
use std::sync::Arc;

/// How boxes are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayStyle {
    pub color: [u8; 4],
    pub line_width: u32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: defaults::DEFAULT_COLOR,
            line_width: defaults::DEFAULT_LINE_WIDTH,
        }
    }
}

/// Why a detection was not drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Detection is more than `max_staleness` frames behind
    Stale { lag: u64 },
    /// Detection belongs to a frame newer than the one displayed
    Ahead,
}

/// What is drawn on top of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    /// No detection available yet
    None,
    /// A detection exists but must not be drawn on this frame
    Suppressed {
        detection_sequence: u64,
        reason: Suppression,
    },
    /// Objects to draw (may be empty when nothing passed the confidence filter)
    Boxes {
        detection_sequence: u64,
        objects: Vec<DetectedObject>,
    },
}

/// Display-ready pairing of a frame and its overlay
#[derive(Debug, Clone)]
pub struct Composite {
    pub frame: Arc<Frame>,
    pub overlay: Overlay,
    pub style: OverlayStyle,
}

impl Composite {
    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    /// Objects that will be drawn (empty unless the overlay is `Boxes`)
    pub fn objects(&self) -> &[DetectedObject] {
        match &self.overlay {
            Overlay::Boxes { objects, .. } => objects,
            _ => &[],
        }
    }

    /// Highest-confidence drawn object
    pub fn top_object(&self) -> Option<&DetectedObject> {
        self.objects()
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self.overlay, Overlay::Suppressed { .. })
    }

    /// Rasterize the frame with box outlines drawn on it
    pub fn render(&self) -> RgbaImage {
        let mut image = self.frame.to_rgba_image();
        let (width, height) = image.dimensions();
        let color = Rgba(self.style.color);

        for object in self.objects() {
            let (x, y, w, h) = object.bbox.to_pixels(width, height);
            draw_outline(&mut image, x, y, w, h, self.style.line_width, color);
        }
        image
    }

    /// Render and encode as JPEG
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, image::ImageError> {
        let rgb = DynamicImage::ImageRgba8(self.render()).to_rgb8();
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).encode_image(&rgb)?;
        Ok(bytes)
    }
}

/// Merges frames with detections
#[derive(Debug, Clone)]
pub struct OverlayCompositor {
    max_staleness: u64,
    min_confidence: f32,
    style: OverlayStyle,
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self::new(
            defaults::DEFAULT_MAX_STALENESS,
            defaults::DEFAULT_MIN_CONFIDENCE,
            OverlayStyle::default(),
        )
    }
}

impl OverlayCompositor {
    pub fn new(max_staleness: u64, min_confidence: f32, style: OverlayStyle) -> Self {
        Self {
            max_staleness,
            min_confidence,
            style,
        }
    }

    pub fn from_config(config: &OverlayConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.max_staleness,
            config.min_confidence,
            OverlayStyle {
                color: config.color_rgba()?,
                line_width: config.line_width,
            },
        ))
    }

    pub fn max_staleness(&self) -> u64 {
        self.max_staleness
    }

    /// Pair `frame` with `detection` under the staleness rule
    pub fn compose(&self, frame: &Arc<Frame>, detection: Option<&Detection>) -> Composite {
        let overlay = match detection {
            None => Overlay::None,
            Some(d) if d.sequence > frame.sequence => Overlay::Suppressed {
                detection_sequence: d.sequence,
                reason: Suppression::Ahead,
            },
            Some(d) if d.sequence.saturating_add(self.max_staleness) < frame.sequence => {
                Overlay::Suppressed {
                    detection_sequence: d.sequence,
                    reason: Suppression::Stale {
                        lag: frame.sequence - d.sequence,
                    },
                }
            }
            Some(d) => Overlay::Boxes {
                detection_sequence: d.sequence,
                objects: d
                    .objects
                    .iter()
                    .filter(|o| o.confidence >= self.min_confidence)
                    .cloned()
                    .collect(),
            },
        };

        Composite {
            frame: Arc::clone(frame),
            overlay,
            style: self.style,
        }
    }
}

/// Draw a rectangle outline `thickness` pixels wide, inside the rectangle
fn draw_outline(
    image: &mut RgbaImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    thickness: u32,
    color: Rgba<u8>,
) {
    if width == 0 || height == 0 {
        return;
    }
    let t = thickness.max(1).min(width.div_ceil(2)).min(height.div_ceil(2));
    let (x1, y1) = (x + width, y + height);

    for py in y..y1 {
        for px in x..x1 {
            let on_edge = px < x + t || px >= x1 - t || py < y + t || py >= y1 - t;
            if on_edge && px < image.width() && py < image.height() {
                image.put_pixel(px, py, color);
            }
        }
    }
}
