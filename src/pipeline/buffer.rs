// SPDX-License-Identifier: GPL-3.0-only

//! Latest-wins frame slot
//!
//! Decouples the capture rate from everything downstream: the writer never
//! waits, unread frames are simply replaced, and readers always see the
//! newest frame at the time they look.

use crate::backends::camera::types::Frame;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Single-slot frame buffer
///
/// A publish whose sequence is not newer than the held frame is rejected,
/// so no reader ever sees sequence numbers going backwards.
#[derive(Debug)]
pub struct FrameBuffer {
    slot: watch::Sender<Option<Arc<Frame>>>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Replace the held frame
    ///
    /// Returns false (and leaves the slot untouched) when `frame` is not
    /// newer than the frame already held.
    pub fn publish(&self, frame: Arc<Frame>) -> bool {
        let sequence = frame.sequence;
        let accepted = self.slot.send_if_modified(|held| match held {
            Some(current) if current.sequence >= sequence => false,
            _ => {
                *held = Some(frame);
                true
            }
        });
        if !accepted {
            trace!(sequence, "Rejected out-of-order frame");
        }
        accepted
    }

    /// Newest frame, if any has been published
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.borrow().clone()
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.slot.borrow().as_ref().map(|f| f.sequence)
    }

    /// Drop the held frame (between sessions)
    pub fn clear(&self) {
        self.slot.send_replace(None);
    }

    /// Independent reader that can await newer frames
    pub fn reader(&self) -> FrameReader {
        FrameReader {
            receiver: self.slot.subscribe(),
            primed: false,
        }
    }
}

/// Reading end of a [`FrameBuffer`]
#[derive(Debug, Clone)]
pub struct FrameReader {
    receiver: watch::Receiver<Option<Arc<Frame>>>,
    primed: bool,
}

impl FrameReader {
    /// Wait for a frame newer than the last one this reader returned
    ///
    /// The first call returns the held frame right away, if there is one.
    /// Intermediate frames published while the reader was busy are skipped.
    /// Returns `None` once the buffer is dropped.
    pub async fn next(&mut self) -> Option<Arc<Frame>> {
        loop {
            if self.primed {
                self.receiver.changed().await.ok()?;
            }
            self.primed = true;
            if let Some(frame) = self.receiver.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }

    /// Latest frame without waiting, whether or not it was seen before
    pub fn try_latest(&self) -> Option<Arc<Frame>> {
        self.receiver.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame::solid(sequence, 1, 1, [0, 0, 0, 255]))
    }

    #[test]
    fn test_latest_wins() {
        let buffer = FrameBuffer::new();
        assert!(buffer.latest().is_none());
        for sequence in 1..=5 {
            assert!(buffer.publish(frame(sequence)));
        }
        assert_eq!(buffer.latest_sequence(), Some(5));
    }

    #[test]
    fn test_rejects_non_newer_frames() {
        let buffer = FrameBuffer::new();
        assert!(buffer.publish(frame(4)));
        assert!(!buffer.publish(frame(4)));
        assert!(!buffer.publish(frame(2)));
        assert_eq!(buffer.latest_sequence(), Some(4));
    }

    #[test]
    fn test_clear_allows_new_session() {
        let buffer = FrameBuffer::new();
        buffer.publish(frame(10));
        buffer.clear();
        assert!(buffer.publish(frame(1)));
    }

    #[tokio::test]
    async fn test_slow_reader_skips_to_latest() {
        let buffer = FrameBuffer::new();
        let mut reader = buffer.reader();

        buffer.publish(frame(1));
        assert_eq!(reader.next().await.map(|f| f.sequence), Some(1));

        buffer.publish(frame(2));
        buffer.publish(frame(3));
        buffer.publish(frame(4));
        assert_eq!(reader.next().await.map(|f| f.sequence), Some(4));
    }

    #[tokio::test]
    async fn test_reader_waits_for_newer() {
        let buffer = Arc::new(FrameBuffer::new());
        let mut reader = buffer.reader();
        buffer.publish(frame(1));
        reader.next().await;

        let writer = Arc::clone(&buffer);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            writer.publish(frame(2));
        });
        assert_eq!(reader.next().await.map(|f| f.sequence), Some(2));
    }

    #[tokio::test]
    async fn test_reader_ends_when_buffer_dropped() {
        let buffer = FrameBuffer::new();
        let mut reader = buffer.reader();
        drop(buffer);
        assert!(reader.next().await.is_none());
    }
}
