// SPDX-License-Identifier: GPL-3.0-only

//! Application-fed source
//!
//! For hosts that already own a capture stack: frames are pushed through a
//! [`FrameInjector`] and flow through the pipeline exactly like device
//! frames (sequenced, latest-wins, replaced when the consumer is behind).

pub use super::frame_loop::PushOutcome;
use super::frame_loop::FrameDelivery;
use super::types::CaptureFormat;
use super::{CaptureHandle, FrameSource};
use crate::errors::DeviceError;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Source whose frames are injected by the application
pub struct ManualSource {
    delivery: Arc<Mutex<Option<FrameDelivery>>>,
}

/// Pushes frames into the currently open [`ManualSource`] handle
#[derive(Clone)]
pub struct FrameInjector {
    delivery: Arc<Mutex<Option<FrameDelivery>>>,
}

fn lock(delivery: &Mutex<Option<FrameDelivery>>) -> MutexGuard<'_, Option<FrameDelivery>> {
    delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ManualSource {
    /// Create a source and the injector that feeds it
    pub fn new() -> (Self, FrameInjector) {
        let delivery = Arc::new(Mutex::new(None));
        (
            Self {
                delivery: Arc::clone(&delivery),
            },
            FrameInjector { delivery },
        )
    }
}

impl FrameSource for ManualSource {
    fn describe(&self) -> String {
        "application-fed frames".to_string()
    }

    fn open(&mut self, format: &CaptureFormat) -> Result<CaptureHandle, DeviceError> {
        info!(format = %format, "Opening manual source");

        // A new handle starts a new sequence; any previous handle sees its
        // producer go away
        let (delivery, receiver) = FrameDelivery::slot("manual");
        *lock(&self.delivery) = Some(delivery);

        Ok(CaptureHandle::new(self.describe(), receiver, None))
    }
}

impl FrameInjector {
    /// Push a tightly packed RGBA frame
    pub fn push_rgba(&self, width: u32, height: u32, data: Vec<u8>) -> PushOutcome {
        let mut slot = lock(&self.delivery);
        let Some(delivery) = slot.as_mut() else {
            return PushOutcome::NotOpen;
        };

        let outcome = delivery.push(width, height, width * 4, Arc::from(data));
        if outcome == PushOutcome::NotOpen {
            debug!("Manual source consumer closed");
            *slot = None;
        }
        outcome
    }

    /// Push a frame filled with one color
    pub fn push_solid(&self, width: u32, height: u32, rgba: [u8; 4]) -> PushOutcome {
        let len = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4);
        let data = rgba.iter().copied().cycle().take(len).collect();
        self.push_rgba(width, height, data)
    }

    /// Report that the upstream device went away
    ///
    /// Returns false if there is no open handle to notify.
    pub fn disconnect(&self, reason: &str) -> bool {
        let Some(delivery) = lock(&self.delivery).take() else {
            return false;
        };
        if delivery.is_closed() {
            return false;
        }
        delivery.lost(DeviceError::Disconnected(reason.to_string()));
        true
    }

    /// Whether a consumer is attached
    pub fn is_open(&self) -> bool {
        lock(&self.delivery)
            .as_ref()
            .is_some_and(|delivery| !delivery.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::CaptureEvent;

    #[test]
    fn test_push_without_open_handle() {
        let (_source, injector) = ManualSource::new();
        assert_eq!(injector.push_solid(2, 2, [0; 4]), PushOutcome::NotOpen);
        assert!(!injector.is_open());
    }

    #[test]
    fn test_unread_frame_is_replaced_by_newest() {
        let (mut source, injector) = ManualSource::new();
        let mut handle = source.open(&CaptureFormat::new(2, 2, 30)).unwrap();

        assert_eq!(injector.push_solid(2, 2, [1; 4]), PushOutcome::Delivered(1));
        assert_eq!(
            injector.push_solid(2, 2, [2; 4]),
            PushOutcome::Replaced {
                sequence: 2,
                dropped: 1
            }
        );
        assert_eq!(
            injector.push_solid(2, 2, [3; 4]),
            PushOutcome::Replaced {
                sequence: 3,
                dropped: 2
            }
        );
        assert_eq!(handle.dropped_frames(), 2);

        match handle.try_next_event() {
            Some(CaptureEvent::Frame(frame)) => {
                assert_eq!(frame.sequence, 3);
                assert_eq!(frame.data[0], 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(handle.try_next_event().is_none());
    }

    #[test]
    fn test_reopen_restarts_sequence() {
        let (mut source, injector) = ManualSource::new();
        let first = source.open(&CaptureFormat::new(2, 2, 30)).unwrap();
        injector.push_solid(2, 2, [0; 4]);
        drop(first);

        let _second = source.open(&CaptureFormat::new(2, 2, 30)).unwrap();
        assert_eq!(injector.push_solid(2, 2, [0; 4]), PushOutcome::Delivered(1));
    }

    #[test]
    fn test_closed_handle_detaches_injector() {
        let (mut source, injector) = ManualSource::new();
        let mut handle = source.open(&CaptureFormat::new(2, 2, 30)).unwrap();
        handle.close();
        assert_eq!(injector.push_solid(2, 2, [0; 4]), PushOutcome::NotOpen);
        assert!(!injector.is_open());
    }

    #[test]
    fn test_disconnect_delivers_lost() {
        let (mut source, injector) = ManualSource::new();
        let mut handle = source.open(&CaptureFormat::new(2, 2, 30)).unwrap();
        injector.push_solid(2, 2, [0; 4]);
        assert!(injector.disconnect("unplugged"));
        assert!(matches!(
            handle.try_next_event(),
            Some(CaptureEvent::Lost(DeviceError::Disconnected(_)))
        ));
        assert!(handle.try_next_event().is_none());
        assert!(!injector.disconnect("again"));
    }
}
