// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 webcam source
//!
//! Opens the device node and negotiates the format on the caller's thread so
//! that a missing or inaccessible device is reported by `open()`. Buffers
//! are then streamed over mmap on a dedicated capture thread and converted
//! to RGBA before delivery.

use super::format_converters::{mjpeg_to_rgba, rgb_to_rgba, uyvy_to_rgba, yuyv_to_rgba};
use super::frame_loop::{CaptureLoopController, FrameDelivery, LoopAction};
use super::types::{CaptureFormat, DeviceInfo};
use super::{CaptureHandle, FrameSource};
use crate::constants::capture::V4L2_BUFFER_COUNT;
use crate::errors::DeviceError;
use std::sync::Arc;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Format, FourCC};

/// errno for a vanished device node
const ENODEV: i32 = 19;

/// Consecutive dequeue failures tolerated before the device is declared lost
const MAX_CONSECUTIVE_ERRORS: u32 = 30;

/// Pixel formats we can convert, in order of preference
const PREFERRED_FOURCCS: [&[u8; 4]; 4] = [b"YUYV", b"MJPG", b"UYVY", b"RGB3"];

/// Webcam behind a `/dev/videoN` node
pub struct V4l2Source {
    device: String,
}

impl V4l2Source {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

/// Per-thread capture state
struct StreamState {
    stream: MmapStream<'static>,
    format: Format,
    consecutive_errors: u32,
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!("v4l2 {}", self.device)
    }

    fn open(&mut self, format: &CaptureFormat) -> Result<CaptureHandle, DeviceError> {
        info!(device = %self.device, format = %format, "Opening V4L2 device");

        let dev = Device::with_path(&self.device)
            .map_err(|e| DeviceError::from_open_error(&self.device, &e))?;

        let caps = dev
            .query_caps()
            .map_err(|e| DeviceError::from_open_error(&self.device, &e))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(DeviceError::Unavailable(format!(
                "{} ({}) is not a capture device",
                self.device, caps.card
            )));
        }

        let negotiated = negotiate_format(&dev, format).ok_or_else(|| {
            DeviceError::Unavailable(format!(
                "{} supports none of the convertible pixel formats",
                self.device
            ))
        })?;

        if let Err(e) = dev.set_params(&Parameters::with_fps(format.framerate.as_f64().round() as u32)) {
            warn!(error = %e, "Could not set framerate, using device default");
        }

        info!(
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "V4L2 format configured"
        );

        let (delivery, receiver) = FrameDelivery::slot(&self.device);
        let device_path = self.device.clone();

        let worker = CaptureLoopController::start(
            &self.device,
            delivery,
            move || {
                let stream = MmapStream::with_buffers(&dev, Type::VideoCapture, V4L2_BUFFER_COUNT)
                    .map_err(|e| DeviceError::from_open_error(&device_path, &e))?;
                debug!(device = %device_path, "V4L2 stream started");
                Ok(StreamState {
                    stream,
                    format: negotiated,
                    consecutive_errors: 0,
                })
            },
            capture_step,
        );

        Ok(CaptureHandle::new(self.describe(), receiver, Some(worker)))
    }
}

/// Try the preferred formats at the requested size; first accepted wins
fn negotiate_format(dev: &Device, requested: &CaptureFormat) -> Option<Format> {
    for fourcc in PREFERRED_FOURCCS {
        let wanted = FourCC::new(fourcc);
        match dev.set_format(&Format::new(requested.width, requested.height, wanted)) {
            Ok(actual) if actual.fourcc == wanted => return Some(actual),
            Ok(actual) => {
                debug!(wanted = %wanted, got = %actual.fourcc, "Format not accepted");
            }
            Err(e) => {
                debug!(wanted = %wanted, error = %e, "Failed to set format");
            }
        }
    }
    None
}

fn capture_step(state: &mut StreamState, delivery: &mut FrameDelivery) -> LoopAction {
    let (buf, meta) = match state.stream.next() {
        Ok(frame) => frame,
        Err(e) => {
            state.consecutive_errors += 1;
            if e.raw_os_error() == Some(ENODEV)
                || state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS
            {
                delivery.lost(DeviceError::Disconnected(e.to_string()));
                return LoopAction::Stop;
            }
            warn!(error = %e, "Failed to dequeue V4L2 buffer");
            std::thread::sleep(std::time::Duration::from_millis(10));
            return LoopAction::Continue;
        }
    };
    state.consecutive_errors = 0;

    // Compressed formats only fill part of the buffer
    let used = meta.bytesused as usize;
    let buf = if used > 0 && used <= buf.len() {
        &buf[..used]
    } else {
        buf
    };

    let format = &state.format;
    let (width, height) = (format.width, format.height);
    let rgba = match &format.fourcc.repr {
        b"YUYV" => yuyv_to_rgba(buf, width, height, format.stride),
        b"UYVY" => uyvy_to_rgba(buf, width, height, format.stride),
        b"RGB3" => rgb_to_rgba(buf),
        b"MJPG" => match mjpeg_to_rgba(buf) {
            Ok((w, h, data)) if w == width && h == height => data,
            Ok((w, h, _)) => {
                warn!(w, h, "MJPEG frame size differs from negotiated format");
                return LoopAction::Continue;
            }
            Err(e) => {
                // Corrupt JPEGs happen on USB hiccups; skip the frame
                debug!(error = %e, "Failed to decode MJPEG frame");
                return LoopAction::Continue;
            }
        },
        _ => {
            delivery.lost(DeviceError::Unavailable(format!(
                "unsupported pixel format {}",
                format.fourcc
            )));
            return LoopAction::Stop;
        }
    };

    delivery.deliver(width, height, width * 4, Arc::from(rgba))
}

/// Enumerate V4L2 capture devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = v4l::context::enum_devices()
        .into_iter()
        .filter_map(|node| {
            let path = node.path().to_string_lossy().to_string();
            let dev = Device::with_path(node.path()).ok()?;
            let caps = dev.query_caps().ok()?;
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                return None;
            }
            Some(DeviceInfo {
                path,
                card: caps.card,
                driver: caps.driver,
            })
        })
        .collect();

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(count = devices.len(), "Enumerated V4L2 capture devices");
    devices
}
