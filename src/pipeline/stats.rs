// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline counters and status snapshots

use crate::constants::status::FPS_SMOOTHING;
use crate::pipeline::state::PipelineState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Monotonic counters for one controller
///
/// Counters survive restarts of the controller; they describe everything
/// it has done since it was created.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub composites_presented: AtomicU64,
    pub overlays_suppressed: AtomicU64,
    pub inference_submitted: AtomicU64,
    pub inference_busy: AtomicU64,
    pub inference_retried: AtomicU64,
    pub inference_failed: AtomicU64,
    pub inference_invalid: AtomicU64,
    pub detections_applied: AtomicU64,
    pub detections_discarded: AtomicU64,
    fps: Mutex<FpsEstimator>,
}

#[derive(Debug, Default)]
struct FpsEstimator {
    last: Option<Instant>,
    fps: f64,
}

impl FpsEstimator {
    fn tick(&mut self, now: Instant) {
        if let Some(last) = self.last {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant = 1.0 / dt;
                self.fps = if self.fps == 0.0 {
                    instant
                } else {
                    self.fps + FPS_SMOOTHING * (instant - self.fps)
                };
            }
        }
        self.last = Some(now);
    }
}

/// Plain copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsCounters {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_rejected: u64,
    pub composites_presented: u64,
    pub overlays_suppressed: u64,
    pub inference_submitted: u64,
    pub inference_busy: u64,
    pub inference_retried: u64,
    pub inference_failed: u64,
    pub inference_invalid: u64,
    pub detections_applied: u64,
    pub detections_discarded: u64,
    pub fps: f64,
}

/// Status payload for logs, the CLI and the terminal status bar
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session_id: Option<String>,
    pub state: PipelineState,
    pub source: String,
    pub backend: String,
    pub latest_frame: Option<u64>,
    pub latest_detection: Option<u64>,
    /// Top object of the latest applied detection
    pub label: Option<String>,
    pub confidence: Option<f32>,
    /// RFC 3339 wall-clock time the snapshot was taken
    pub timestamp: String,
    #[serde(flatten)]
    pub counters: StatsCounters,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn fps_lock(&self) -> MutexGuard<'_, FpsEstimator> {
        self.fps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count a frame and feed the fps estimate
    pub fn record_frame(&self, at: Instant) {
        bump(&self.frames_captured);
        self.fps_lock().tick(at);
    }

    pub fn record_rejected(&self) {
        bump(&self.frames_rejected);
    }

    pub fn record_presented(&self, suppressed: bool) {
        bump(&self.composites_presented);
        if suppressed {
            bump(&self.overlays_suppressed);
        }
    }

    pub fn record_submitted(&self) {
        bump(&self.inference_submitted);
    }

    pub fn record_busy(&self) {
        bump(&self.inference_busy);
    }

    /// Retries are attempts beyond the first
    pub fn record_attempts(&self, attempts: u32) {
        self.inference_retried
            .fetch_add(attempts.saturating_sub(1) as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        bump(&self.inference_failed);
    }

    pub fn record_invalid(&self) {
        bump(&self.inference_invalid);
    }

    pub fn record_detection(&self, applied: bool) {
        if applied {
            bump(&self.detections_applied);
        } else {
            bump(&self.detections_discarded);
        }
    }

    /// Add frames the capture side replaced before they were read
    pub fn record_dropped(&self, dropped: u64) {
        self.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Forget the fps history (between sessions)
    pub fn reset_fps(&self) {
        *self.fps_lock() = FpsEstimator::default();
    }

    pub fn fps(&self) -> f64 {
        self.fps_lock().fps
    }

    pub fn counters(&self) -> StatsCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsCounters {
            frames_captured: load(&self.frames_captured),
            frames_dropped: load(&self.frames_dropped),
            frames_rejected: load(&self.frames_rejected),
            composites_presented: load(&self.composites_presented),
            overlays_suppressed: load(&self.overlays_suppressed),
            inference_submitted: load(&self.inference_submitted),
            inference_busy: load(&self.inference_busy),
            inference_retried: load(&self.inference_retried),
            inference_failed: load(&self.inference_failed),
            inference_invalid: load(&self.inference_invalid),
            detections_applied: load(&self.detections_applied),
            detections_discarded: load(&self.detections_discarded),
            fps: (self.fps() * 10.0).round() / 10.0,
        }
    }
}
