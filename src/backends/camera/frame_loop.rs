// SPDX-License-Identifier: GPL-3.0-only
//! Capture thread lifecycle and frame delivery
//!
//! Every device-backed source runs its capture loop on a dedicated thread
//! managed by [`CaptureLoopController`]. Frames leave the thread through a
//! [`FrameDelivery`] into a single latest-wins slot: a frame captured while
//! the previous one is still unread replaces it, and the replaced frame is
//! counted as dropped. Device loss travels beside the slot and is never
//! dropped.

use super::types::{CaptureEvent, Frame, FrameSequencer};
use crate::constants::capture::LOG_EVERY_N_FRAMES;
use crate::errors::DeviceError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// Action returned by the capture loop step to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Capture the next frame
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Result of handing a frame to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame stored for the consumer with this sequence number
    Delivered(u64),
    /// Frame stored; the unread frame `dropped` it replaced was discarded
    Replaced { sequence: u64, dropped: u64 },
    /// No consumer is attached
    NotOpen,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    lost: Option<DeviceError>,
    producer_gone: bool,
    consumer_closed: bool,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sending half of a capture handle
///
/// Stamps sequence numbers in capture order and stores each frame in the
/// consumer's slot without ever blocking.
pub struct FrameDelivery {
    slot: Arc<Slot>,
    sequencer: FrameSequencer,
    name: String,
}

/// Receiving half of a capture handle
pub struct FrameReceiver {
    slot: Arc<Slot>,
}

impl FrameDelivery {
    /// Create a delivery slot and its receiver
    pub fn slot(name: &str) -> (Self, FrameReceiver) {
        let slot = Arc::new(Slot::default());
        let delivery = Self {
            slot: Arc::clone(&slot),
            sequencer: FrameSequencer::new(),
            name: name.to_string(),
        };
        (delivery, FrameReceiver { slot })
    }

    /// Stamp a captured RGBA buffer and store it for the consumer
    pub fn push(&mut self, width: u32, height: u32, stride: u32, data: Arc<[u8]>) -> PushOutcome {
        let frame = self.sequencer.stamp(width, height, stride, data);
        let sequence = frame.sequence;

        let replaced = {
            let mut state = self.slot.lock();
            if state.consumer_closed {
                return PushOutcome::NotOpen;
            }
            state.frame.replace(frame).map(|old| old.sequence)
        };
        self.slot.notify.notify_one();

        match replaced {
            Some(dropped) => {
                let total = self.slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(source = %self.name, sequence, dropped, total, "Unread frame replaced");
                PushOutcome::Replaced { sequence, dropped }
            }
            None => PushOutcome::Delivered(sequence),
        }
    }

    /// Stamp and deliver a captured RGBA buffer
    ///
    /// Returns `LoopAction::Stop` once the consumer has gone away.
    pub fn deliver(&mut self, width: u32, height: u32, stride: u32, data: Arc<[u8]>) -> LoopAction {
        match self.push(width, height, stride, data) {
            PushOutcome::NotOpen => {
                debug!(source = %self.name, "Frame consumer closed");
                LoopAction::Stop
            }
            PushOutcome::Delivered(sequence) | PushOutcome::Replaced { sequence, .. } => {
                if sequence % LOG_EVERY_N_FRAMES == 0 {
                    debug!(source = %self.name, sequence, width, height, "Frame delivered");
                }
                LoopAction::Continue
            }
        }
    }

    /// Report a fatal device error; no frames follow
    ///
    /// The error is kept apart from the frame slot, so it is never replaced.
    pub fn lost(&self, error: DeviceError) {
        warn!(source = %self.name, error = %error, "Capture device lost");
        {
            let mut state = self.slot.lock();
            if state.consumer_closed {
                return;
            }
            state.frame = None;
            state.lost.get_or_insert(error);
        }
        self.slot.notify.notify_one();
    }

    /// Whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.slot.lock().consumer_closed
    }

    /// Frames stamped so far (delivered or dropped)
    pub fn captured(&self) -> u64 {
        self.sequencer.issued()
    }
}

impl Drop for FrameDelivery {
    fn drop(&mut self) {
        self.slot.lock().producer_gone = true;
        self.slot.notify.notify_one();
    }
}

impl FrameReceiver {
    /// Take whatever is ready: device loss first, then the latest frame
    ///
    /// `None` with `done == true` means the producer is gone and nothing
    /// is left.
    fn poll(&self) -> (Option<CaptureEvent>, bool) {
        let mut state = self.slot.lock();
        if state.consumer_closed {
            return (None, true);
        }
        if let Some(error) = state.lost.take() {
            state.frame = None;
            return (Some(CaptureEvent::Lost(error)), false);
        }
        if let Some(frame) = state.frame.take() {
            return (Some(CaptureEvent::Frame(frame)), false);
        }
        (None, state.producer_gone)
    }

    /// Wait for the next frame or device error
    ///
    /// Returns `None` once closed, or once the producer is gone and the
    /// slot is empty.
    pub async fn recv(&mut self) -> Option<CaptureEvent> {
        loop {
            match self.poll() {
                (Some(event), _) => return Some(event),
                (None, true) => return None,
                // Single consumer: a notify_one permit is never lost
                (None, false) => self.slot.notify.notified().await,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<CaptureEvent> {
        self.poll().0
    }

    /// Frames replaced before the consumer took them
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Detach from the producer and discard anything unread
    pub fn close(&mut self) {
        let mut state = self.slot.lock();
        state.consumer_closed = true;
        state.frame = None;
        state.lost = None;
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.close();
    }
}
/// Controller for a capture loop running in a separate thread
pub struct CaptureLoopController {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<()>>,
    /// Signal to stop the loop
    stop_signal: Arc<AtomicBool>,
    /// Name for logging
    name: String,
}

impl CaptureLoopController {
    /// Start a capture loop in a separate thread
    ///
    /// `init_fn` runs once on the capture thread to acquire per-thread state
    /// (e.g. a V4L2 mmap stream). If it fails, the error is reported through
    /// `delivery` and the thread exits. `step_fn` then runs until it returns
    /// `LoopAction::Stop`, the consumer closes, or `stop()` is called.
    pub fn start<S, I, F>(
        name: &str,
        mut delivery: FrameDelivery,
        init_fn: I,
        mut step_fn: F,
    ) -> Self
    where
        S: 'static,
        I: FnOnce() -> Result<S, DeviceError> + Send + 'static,
        F: FnMut(&mut S, &mut FrameDelivery) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting capture loop");

        let thread_handle = thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                let mut state = match init_fn() {
                    Ok(s) => s,
                    Err(e) => {
                        delivery.lost(e);
                        return;
                    }
                };

                loop {
                    if stop_signal_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    if step_fn(&mut state, &mut delivery) == LoopAction::Stop {
                        debug!(name = %name_clone, "Loop requested stop");
                        break;
                    }
                }

                info!(
                    name = %name_clone,
                    frames = delivery.captured(),
                    "Capture loop thread exiting"
                );
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to spawn capture thread");
                None
            }
        };

        Self {
            thread_handle,
            stop_signal,
            name: name.to_string(),
        }
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop (non-blocking)
    pub fn request_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for the thread to finish
    ///
    /// Blocks for at most one capture step.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.thread_handle.take() {
            debug!(name = %self.name, "Waiting for capture loop thread to finish");
            if handle.join().is_err() {
                warn!(name = %self.name, "Capture loop thread panicked");
            }
        }
    }
}

impl Drop for CaptureLoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pixel() -> Arc<[u8]> {
        Arc::from(vec![0u8; 4].as_slice())
    }

    fn sequence(event: Option<CaptureEvent>) -> Option<u64> {
        match event {
            Some(CaptureEvent::Frame(frame)) => Some(frame.sequence),
            _ => None,
        }
    }

    #[test]
    fn test_burst_keeps_only_newest_frame() {
        let (mut delivery, mut receiver) = FrameDelivery::slot("burst");

        assert_eq!(delivery.push(1, 1, 4, pixel()), PushOutcome::Delivered(1));
        for expected in 2..=5 {
            assert_eq!(
                delivery.push(1, 1, 4, pixel()),
                PushOutcome::Replaced {
                    sequence: expected,
                    dropped: expected - 1
                }
            );
        }

        assert_eq!(sequence(receiver.try_recv()), Some(5));
        assert!(receiver.try_recv().is_none());
        assert_eq!(receiver.dropped(), 4);

        // Once taken, the next frame is delivered, not replacing anything
        assert_eq!(delivery.push(1, 1, 4, pixel()), PushOutcome::Delivered(6));
        assert_eq!(sequence(receiver.try_recv()), Some(6));
    }

    #[test]
    fn test_loss_survives_frame_burst() {
        let (mut delivery, mut receiver) = FrameDelivery::slot("lost");
        delivery.push(1, 1, 4, pixel());
        delivery.lost(DeviceError::Disconnected("unplugged".into()));
        delivery.push(1, 1, 4, pixel());

        assert!(matches!(
            receiver.try_recv(),
            Some(CaptureEvent::Lost(DeviceError::Disconnected(_)))
        ));
    }

    #[test]
    fn test_loop_drops_instead_of_blocking() {
        let (delivery, mut receiver) = FrameDelivery::slot("full");

        let mut controller = CaptureLoopController::start(
            "full",
            delivery,
            || Ok(0u32),
            |count, delivery| {
                *count += 1;
                delivery.deliver(1, 1, 4, pixel());
                if *count == 10 {
                    LoopAction::Stop
                } else {
                    LoopAction::Continue
                }
            },
        );
        controller.stop();

        assert_eq!(receiver.dropped(), 9);
        assert_eq!(sequence(receiver.try_recv()), Some(10));
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_ends_when_producer_exits() {
        let (delivery, mut receiver) = FrameDelivery::slot("ends");

        let mut controller = CaptureLoopController::start(
            "ends",
            delivery,
            || Ok(()),
            |_, delivery| {
                delivery.deliver(1, 1, 4, pixel());
                LoopAction::Stop
            },
        );

        let first = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("frame arrives");
        assert_eq!(sequence(first), Some(1));
        let end = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("stream ends");
        assert!(end.is_none());
        controller.stop();
    }

    #[test]
    fn test_init_failure_is_reported() {
        let (delivery, mut receiver) = FrameDelivery::slot("fail");

        let mut controller = CaptureLoopController::start(
            "fail",
            delivery,
            || Err::<(), _>(DeviceError::Unavailable("no such device".into())),
            |_, _| LoopAction::Continue,
        );
        controller.stop();

        match receiver.try_recv() {
            Some(CaptureEvent::Lost(DeviceError::Unavailable(_))) => {}
            other => panic!("expected Lost event, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_consumer_stops_loop() {
        let (delivery, receiver) = FrameDelivery::slot("closed");
        drop(receiver);

        let controller = CaptureLoopController::start(
            "closed",
            delivery,
            || Ok(()),
            |_, delivery| delivery.deliver(1, 1, 4, pixel()),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while controller.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!controller.is_running());
    }
}
