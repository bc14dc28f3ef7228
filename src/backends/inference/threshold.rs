// SPDX-License-Identifier: GPL-3.0-only

//! Luminance blob detector
//!
//! Finds connected regions of bright pixels and reports each as a
//! `bright_region` object. Needs no model, so it backs the demos and runs
//! fine against the synthetic source. Frames are downscaled before the
//! search to keep the per-frame cost small.

use super::{InferenceBackend, InferenceRequest, InferenceResponse};
use crate::backends::camera::format_converters::luma;
use crate::backends::camera::types::Frame;
use crate::constants::inference::{DEFAULT_LUMA_THRESHOLD, DETECTOR_MAX_DIMENSION};
use crate::errors::InferenceError;
use crate::pipeline::types::{BoundingBox, DetectedObject};
use futures::FutureExt;
use futures::future::BoxFuture;
use image::imageops;
use tracing::{debug, trace, warn};

/// Label reported for every region
pub const REGION_LABEL: &str = "bright_region";

/// Regions smaller than this fraction of the processed image are noise
const MIN_AREA_FRACTION: f32 = 0.001;

/// Bright-region detector
pub struct ThresholdDetector {
    threshold: u8,
    max_dimension: u32,
}

impl Default for ThresholdDetector {
    fn default() -> Self {
        Self::new(DEFAULT_LUMA_THRESHOLD)
    }
}

impl ThresholdDetector {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            max_dimension: DETECTOR_MAX_DIMENSION,
        }
    }

    /// Create a detector with custom max dimension
    pub fn with_max_dimension(threshold: u8, max_dimension: u32) -> Self {
        Self {
            threshold,
            max_dimension: max_dimension.max(1),
        }
    }
}

impl InferenceBackend for ThresholdDetector {
    fn name(&self) -> &str {
        "threshold"
    }

    fn infer(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'static, Result<InferenceResponse, InferenceError>> {
        let threshold = self.threshold;
        let max_dim = self.max_dimension;

        async move {
            let sequence = request.sequence;
            // CPU-bound; keep it off the async workers
            let objects =
                tokio::task::spawn_blocking(move || detect_sync(&request.frame, threshold, max_dim))
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "Threshold detection task failed");
                        InferenceError::Transport(format!("detection task failed: {}", e))
                    })?;
            Ok(InferenceResponse::new(sequence, objects))
        }
        .boxed()
    }
}

/// Synchronous detection (runs in blocking task)
pub fn detect_sync(frame: &Frame, threshold: u8, max_dimension: u32) -> Vec<DetectedObject> {
    let start = std::time::Instant::now();
    let image = frame.to_rgba_image();

    let (width, height) = image.dimensions();
    let image = if width > max_dimension || height > max_dimension {
        let scale = (width as f32 / max_dimension as f32).max(height as f32 / max_dimension as f32);
        let new_width = ((width as f32 / scale) as u32).max(1);
        let new_height = ((height as f32 / scale) as u32).max(1);
        imageops::thumbnail(&image, new_width, new_height)
    } else {
        image
    };

    let (proc_width, proc_height) = image.dimensions();
    let mask: Vec<u8> = image
        .pixels()
        .map(|p| luma(p[0], p[1], p[2]))
        .collect();

    let min_area = ((proc_width * proc_height) as f32 * MIN_AREA_FRACTION).max(4.0) as u32;
    let regions = find_regions(&mask, proc_width, proc_height, threshold);

    let objects: Vec<DetectedObject> = regions
        .into_iter()
        .filter(|r| r.area >= min_area)
        .map(|r| {
            let bbox = BoundingBox::from_pixels(
                r.min_x,
                r.min_y,
                r.max_x - r.min_x + 1,
                r.max_y - r.min_y + 1,
                proc_width,
                proc_height,
            );
            let confidence = (r.luma_sum as f32 / r.area as f32 / 255.0).clamp(0.0, 1.0);
            DetectedObject::new(REGION_LABEL, confidence, bbox)
        })
        .collect();

    trace!(
        proc_width,
        proc_height,
        elapsed_us = start.elapsed().as_micros(),
        "Threshold detection complete"
    );
    if !objects.is_empty() {
        debug!(
            sequence = frame.sequence,
            count = objects.len(),
            "Threshold detector found regions"
        );
    }

    objects
}

#[derive(Debug)]
struct Region {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
    luma_sum: u64,
}

/// 4-connected components of pixels with luma at or above `threshold`
fn find_regions(luma: &[u8], width: u32, height: u32, threshold: u8) -> Vec<Region> {
    let (w, h) = (width as usize, height as usize);
    let mut visited = vec![false; w * h];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..w * h {
        if visited[start] || luma[start] < threshold {
            continue;
        }

        let mut region = Region {
            min_x: u32::MAX,
            min_y: u32::MAX,
            max_x: 0,
            max_y: 0,
            area: 0,
            luma_sum: 0,
        };
        visited[start] = true;
        stack.push(start);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            region.min_x = region.min_x.min(x as u32);
            region.min_y = region.min_y.min(y as u32);
            region.max_x = region.max_x.max(x as u32);
            region.max_y = region.max_y.max(y as u32);
            region.area += 1;
            region.luma_sum += luma[idx] as u64;

            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < w).then(|| idx + 1),
                (y > 0).then(|| idx - w),
                (y + 1 < h).then(|| idx + w),
            ];
            for next in neighbors.into_iter().flatten() {
                if !visited[next] && luma[next] >= threshold {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }

        regions.push(region);
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::synthetic::{render_pattern, square_geometry};
    use std::sync::Arc;

    fn frame_with_square(width: u32, height: u32, sx: u32, sy: u32, side: u32) -> Frame {
        let mut data = vec![0u8; (width * height * 4) as usize];
        for y in 0..height {
            for x in 0..width {
                let idx = ((y * width + x) * 4) as usize;
                let v = if x >= sx && x < sx + side && y >= sy && y < sy + side {
                    255
                } else {
                    20
                };
                data[idx..idx + 4].copy_from_slice(&[v, v, v, 255]);
            }
        }
        Frame::from_rgba(1, width, height, data)
    }

    #[test]
    fn test_finds_single_square() {
        let frame = frame_with_square(40, 40, 10, 20, 8);
        let objects = detect_sync(&frame, 200, 320);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].label, REGION_LABEL);
        assert_eq!(objects[0].bbox.to_pixels(40, 40), (10, 20, 8, 8));
        assert!(objects[0].confidence > 0.99);
    }

    #[test]
    fn test_dark_frame_has_no_regions() {
        let frame = Frame::solid(1, 32, 32, [30, 30, 30, 255]);
        assert!(detect_sync(&frame, 200, 320).is_empty());
    }

    #[test]
    fn test_tiny_specks_are_ignored() {
        let frame = frame_with_square(100, 100, 50, 50, 1);
        assert!(detect_sync(&frame, 200, 320).is_empty());
    }

    #[test]
    fn test_downscaled_box_stays_normalized() {
        let frame = frame_with_square(640, 480, 320, 240, 160);
        let objects = detect_sync(&frame, 200, 64);
        assert_eq!(objects.len(), 1);
        let bbox = objects[0].bbox;
        assert!((bbox.x - 0.5).abs() < 0.05);
        assert!((bbox.width - 0.25).abs() < 0.05);
        assert!(bbox.is_valid());
    }

    #[test]
    fn test_detects_synthetic_square() {
        let frame = Frame::from_rgba(1, 64, 48, render_pattern(64, 48, 7));
        let (sx, _, side) = square_geometry(64, 48, 7);
        let objects = detect_sync(&frame, DEFAULT_LUMA_THRESHOLD, 320);
        assert_eq!(objects.len(), 1);
        let (x, _, w, _) = objects[0].bbox.to_pixels(64, 48);
        assert_eq!((x, w), (sx, side));
    }

    #[tokio::test]
    async fn test_infer_echoes_sequence() {
        let detector = ThresholdDetector::default();
        let frame = Arc::new(Frame::solid(42, 8, 8, [0, 0, 0, 255]));
        let response = detector.infer(InferenceRequest::new(frame)).await.unwrap();
        assert_eq!(response.sequence, 42);
        assert!(response.objects.is_empty());
    }
}
