// SPDX-License-Identifier: MPL-2.0

//! Capture source abstraction
//!
//! ```text
//! ┌─────────────────────┐
//! │ PipelineController  │  ← owns the handle for one session
//! └──────────┬──────────┘
//!            │ next_event().await
//!            ▼
//! ┌─────────────────────┐
//! │    CaptureHandle    │  ← scoped: close() / Drop release the device
//! └──────────┬──────────┘
//!            │ latest-wins slot, never blocks
//!            ▼
//! ┌─────────────────────┐
//! │ FrameSource thread  │  ← Synthetic / V4L2 / Manual
//! └─────────────────────┘
//! ```

pub mod format_converters;
pub mod frame_loop;
pub mod manual;
pub mod synthetic;
pub mod types;
pub mod v4l2;

pub use frame_loop::{CaptureLoopController, FrameDelivery, FrameReceiver, LoopAction, PushOutcome};
pub use manual::{FrameInjector, ManualSource};
pub use synthetic::SyntheticSource;
pub use types::*;
pub use v4l2::{V4l2Source, list_devices};

use crate::config::SourceSettings;
use crate::errors::DeviceError;
use tracing::debug;

/// A camera-like producer of frames
///
/// `open` acquires the device and starts delivery. Each handle yields its
/// own non-restartable sequence; opening again starts a new one.
pub trait FrameSource: Send {
    /// Human readable description for logs and status output
    fn describe(&self) -> String;

    /// Acquire the device and start capturing
    ///
    /// # Returns
    /// * `Ok(CaptureHandle)` - Capture started
    /// * `Err(DeviceError::Unavailable)` - No such device or it failed to start
    /// * `Err(DeviceError::PermissionDenied)` - Access to the device was refused
    fn open(&mut self, format: &CaptureFormat) -> Result<CaptureHandle, DeviceError>;
}

/// Receiving end of an open capture
///
/// Closing (explicitly or on drop) stops the capture thread and releases the
/// device. After `close()` returns no further events are delivered.
pub struct CaptureHandle {
    source: String,
    receiver: FrameReceiver,
    worker: Option<CaptureLoopController>,
    closed: bool,
}

impl CaptureHandle {
    /// Wrap a delivery slot and the thread feeding it (if any)
    pub fn new(
        source: impl Into<String>,
        receiver: FrameReceiver,
        worker: Option<CaptureLoopController>,
    ) -> Self {
        Self {
            source: source.into(),
            receiver,
            worker,
            closed: false,
        }
    }

    /// Source description this handle was opened from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wait for the next frame or device error
    ///
    /// Returns `None` once the handle is closed or the producer is gone.
    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        if self.closed {
            return None;
        }
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`next_event`](Self::next_event)
    pub fn try_next_event(&mut self) -> Option<CaptureEvent> {
        if self.closed {
            return None;
        }
        self.receiver.try_recv()
    }

    /// Frames replaced before the consumer took them
    pub fn dropped_frames(&self) -> u64 {
        self.receiver.dropped()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop capture and release the device
    ///
    /// Idempotent. Joins the capture thread, so call it off the async
    /// workers (`spawn_blocking`) when a session ends.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Detach first so the capture thread sees a closed consumer
        self.receiver.close();

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        debug!(source = %self.source, dropped = self.dropped_frames(), "Capture handle closed");
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("source", &self.source)
            .field("closed", &self.closed)
            .field("dropped", &self.dropped_frames())
            .finish()
    }
}

/// Build the source described by the configuration
pub fn source_from_settings(settings: &SourceSettings) -> Box<dyn FrameSource> {
    match settings {
        SourceSettings::Synthetic => Box::new(SyntheticSource::new()),
        SourceSettings::V4l2 { device } => Box::new(V4l2Source::new(device)),
    }
}
