// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic test-pattern source
//!
//! Renders a dark gradient with a bright square sweeping back and forth, at
//! the requested framerate. Needs no hardware, so it is the default source
//! and the one the demos run against.

use super::frame_loop::{CaptureLoopController, FrameDelivery};
use super::types::CaptureFormat;
use super::{CaptureHandle, FrameSource};
use crate::errors::DeviceError;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Moving-square test pattern
#[derive(Debug)]
pub struct SyntheticSource;

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        "synthetic test pattern".to_string()
    }

    fn open(&mut self, format: &CaptureFormat) -> Result<CaptureHandle, DeviceError> {
        if format.width == 0 || format.height == 0 || frame_len(format.width, format.height).is_none()
        {
            return Err(DeviceError::Unavailable(format!(
                "synthetic source cannot produce {}",
                format
            )));
        }

        info!(format = %format, "Opening synthetic source");

        let (delivery, receiver) = FrameDelivery::slot("synthetic");
        let format = *format;
        let interval = format.framerate.frame_interval();

        let worker = CaptureLoopController::start(
            "synthetic",
            delivery,
            move || Ok((Instant::now(), 0u64)),
            move |state: &mut (Instant, u64), delivery: &mut FrameDelivery| {
                let (deadline, tick) = state;
                let now = Instant::now();
                if *deadline > now {
                    std::thread::sleep(*deadline - now);
                }
                *deadline += interval;

                let data = render_pattern(format.width, format.height, *tick);
                *tick += 1;

                delivery.deliver(format.width, format.height, format.width * 4, Arc::from(data))
            },
        );

        Ok(CaptureHandle::new(self.describe(), receiver, Some(worker)))
    }
}

/// Square geometry at frame `tick`: (x, y, side) in pixels
pub fn square_geometry(width: u32, height: u32, tick: u64) -> (u32, u32, u32) {
    let side = (width.min(height) / 4).max(1);
    let travel = width.saturating_sub(side).max(1) as u64;
    let step = (width as u64 / 60).max(1);

    // Triangle wave over the horizontal travel
    let phase = (tick * step) % (travel * 2);
    let x = if phase < travel { phase } else { travel * 2 - phase } as u32;
    let y = (height.saturating_sub(side)) / 2;
    (x.min(width.saturating_sub(side)), y, side)
}

/// Byte length of a packed RGBA frame, `None` if it does not fit in memory
fn frame_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(4)
        .filter(|len| *len <= isize::MAX as usize)
}

/// Render one RGBA frame of the pattern
pub fn render_pattern(width: u32, height: u32, tick: u64) -> Vec<u8> {
    let (sx, sy, side) = square_geometry(width, height, tick);
    let mut data = Vec::with_capacity(frame_len(width, height).unwrap_or(0));

    for y in 0..height {
        for x in 0..width {
            let inside = x >= sx && x < sx + side && y >= sy && y < sy + side;
            if inside {
                data.extend_from_slice(&[250, 250, 240, 255]);
            } else {
                // Dark blue-ish gradient, kept well below detector thresholds
                let g = (x as u64 * 60 / width.max(1) as u64) as u8;
                let b = 40 + (y as u64 * 60 / height.max(1) as u64) as u8;
                data.extend_from_slice(&[10, g, b, 255]);
            }
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{CaptureEvent, Framerate};

    #[test]
    fn test_square_stays_in_frame() {
        for tick in 0..500 {
            let (x, y, side) = square_geometry(64, 48, tick);
            assert!(x + side <= 64);
            assert!(y + side <= 48);
        }
    }

    #[test]
    fn test_pattern_has_bright_square() {
        let data = render_pattern(32, 32, 0);
        assert_eq!(data.len(), 32 * 32 * 4);
        let (x, y, _) = square_geometry(32, 32, 0);
        let idx = ((y * 32 + x) * 4) as usize;
        assert_eq!(&data[idx..idx + 3], &[250, 250, 240]);
        assert!(data[2] < 200);
    }

    #[tokio::test]
    async fn test_open_delivers_sequenced_frames() {
        let mut source = SyntheticSource::new();
        let format = CaptureFormat {
            width: 16,
            height: 12,
            framerate: Framerate::from_int(200),
        };
        let mut handle = source.open(&format).expect("synthetic source opens");

        let mut last = 0;
        for _ in 0..3 {
            match handle.next_event().await {
                Some(CaptureEvent::Frame(frame)) => {
                    assert!(frame.sequence > last);
                    assert_eq!((frame.width, frame.height), (16, 12));
                    last = frame.sequence;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        tokio::task::spawn_blocking(move || {
            handle.close();
            assert!(handle.is_closed());
            assert!(handle.try_next_event().is_none());
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_frame_len_is_checked() {
        assert_eq!(frame_len(640, 480), Some(640 * 480 * 4));
        assert_eq!(frame_len(40_000, 40_000), Some(6_400_000_000));
        assert_eq!(frame_len(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_zero_size_is_unavailable() {
        let mut source = SyntheticSource::new();
        let result = source.open(&CaptureFormat::new(0, 10, 30));
        assert!(matches!(result, Err(DeviceError::Unavailable(_))));
    }
}
