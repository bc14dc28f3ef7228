// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline controller
//!
//! Owns one capture source, one inference client and the render surface,
//! and runs them as a session:
//!
//! ```text
//!            stop (oneshot)
//!                 │
//! capture ──► session task ──► FrameBuffer ──► compose ──► RenderSurface
//!  thread         │    ▲
//!                 ▼    │ outcomes
//!           InferenceClient ──► backend (spawned request task)
//! ```
//!
//! The session task is the only place frames, detections and presents
//! happen. `stop()` signals it, waits for it to finish (cancelling
//! inference and releasing the device on the way out), and only then
//! returns, so nothing fires after it.

use crate::backends::camera::types::{CaptureEvent, CaptureFormat, Frame};
use crate::backends::camera::{CaptureHandle, FrameSource, source_from_settings};
use crate::backends::inference::{InferenceBackend, backend_from_settings};
use crate::config::Config;
use crate::errors::{ConfigError, DeviceError, InferenceError, PipelineError, PipelineResult};
use crate::pipeline::buffer::{FrameBuffer, FrameReader};
use crate::pipeline::compositor::OverlayCompositor;
use crate::pipeline::inference::{InferenceClient, InferenceOutcome, RetryPolicy};
use crate::pipeline::render::RenderSurface;
use crate::pipeline::state::PipelineState;
use crate::pipeline::stats::{PipelineStats, StatusSnapshot};
use crate::pipeline::types::Detection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the event broadcast; lagging subscribers lose old events
const EVENT_CAPACITY: usize = 256;

/// Something observable that happened in a session
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// A frame was accepted into the buffer and presented
    Frame { sequence: u64, timestamp_ms: i64 },
    /// A detection was applied
    Detection(Detection),
    /// A request failed after exhausting its attempts, or returned garbage
    InferenceFailed {
        sequence: u64,
        error: InferenceError,
        attempts: u32,
    },
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub format: CaptureFormat,
    pub retry: RetryPolicy,
    /// Per-attempt inference timeout
    pub timeout: Duration,
    /// Minimum spacing between submissions while running
    pub min_interval: Duration,
    /// Minimum spacing between submissions while degraded
    pub degraded_probe_interval: Duration,
    pub compositor: OverlayCompositor,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            format: CaptureFormat::new(
                config.capture.width,
                config.capture.height,
                config.capture.framerate,
            ),
            retry: RetryPolicy::from_config(&config.inference),
            timeout: config.inference.timeout(),
            min_interval: config.inference.min_interval(),
            degraded_probe_interval: config.inference.degraded_probe_interval(),
            compositor: OverlayCompositor::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            format: CaptureFormat::new(
                config.capture.width,
                config.capture.height,
                config.capture.framerate,
            ),
            retry: RetryPolicy::from_config(&config.inference),
            timeout: config.inference.timeout(),
            min_interval: config.inference.min_interval(),
            degraded_probe_interval: config.inference.degraded_probe_interval(),
            compositor: OverlayCompositor::from_config(&config.overlay)?,
        })
    }
}

/// State shared between the controller and its session task
#[derive(Clone)]
struct Shared {
    state: Arc<watch::Sender<PipelineState>>,
    events: broadcast::Sender<PipelineEvent>,
    detection: Arc<watch::Sender<Option<Detection>>>,
    session: Arc<watch::Sender<Option<String>>>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<PipelineStats>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Apply a legal transition; returns false (and changes nothing) otherwise
    fn transition(&self, to: PipelineState) -> bool {
        let mut from = to;
        let changed = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(to) {
                *current = to;
                true
            } else {
                false
            }
        });

        if changed {
            info!(from = %from, to = %to, "Pipeline state changed");
            self.emit(PipelineEvent::StateChanged { from, to });
        } else if from != to {
            debug!(from = %from, to = %to, "Ignoring invalid state transition");
        }
        changed
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

struct Session {
    id: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Lifecycle owner for one pipeline
pub struct PipelineController {
    source: Box<dyn FrameSource>,
    backend: Arc<dyn InferenceBackend>,
    surface: Arc<dyn RenderSurface>,
    settings: PipelineSettings,
    shared: Shared,
    session: Option<Session>,
    source_name: String,
}

impl PipelineController {
    pub fn new(
        source: Box<dyn FrameSource>,
        backend: Arc<dyn InferenceBackend>,
        surface: Arc<dyn RenderSurface>,
        settings: PipelineSettings,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (detection, _) = watch::channel(None);
        let (session, _) = watch::channel(None);
        let source_name = source.describe();

        Self {
            source,
            backend,
            surface,
            settings,
            shared: Shared {
                state: Arc::new(state),
                events,
                detection: Arc::new(detection),
                session: Arc::new(session),
                buffer: Arc::new(FrameBuffer::new()),
                stats: Arc::new(PipelineStats::new()),
            },
            session: None,
            source_name,
        }
    }

    /// Build source, backend and settings from configuration
    pub fn from_config(config: &Config, surface: Arc<dyn RenderSurface>) -> PipelineResult<Self> {
        let settings = PipelineSettings::from_config(config)?;
        Ok(Self::new(
            source_from_settings(&config.capture.source),
            backend_from_settings(&config.inference.detector),
            surface,
            settings,
        ))
    }

    /// Open the source and start a session
    ///
    /// Must be called from within a Tokio runtime. Valid from `Idle`,
    /// `Stopped` and `Failed`. If the device cannot be opened the pipeline
    /// goes to `Failed` and the device error is returned.
    pub fn start(&mut self) -> PipelineResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let from = self.shared.state();
        if !from.can_transition_to(PipelineState::Starting) {
            return Err(PipelineError::InvalidTransition {
                from,
                to: PipelineState::Starting,
            });
        }

        // A failed session released its device before reporting `Failed`
        self.session = None;

        let session_id = uuid::Uuid::new_v4().to_string();
        self.shared.buffer.clear();
        self.shared.detection.send_replace(None);
        self.shared.stats.reset_fps();
        self.shared.transition(PipelineState::Starting);

        info!(
            session = %session_id,
            source = %self.source_name,
            backend = self.backend.name(),
            format = %self.settings.format,
            "Starting pipeline session"
        );

        let handle = match self.source.open(&self.settings.format) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Failed to open capture source");
                self.shared.transition(PipelineState::Failed);
                return Err(e.into());
            }
        };

        let (client, outcomes) = InferenceClient::new(
            Arc::clone(&self.backend),
            self.settings.retry,
            self.settings.timeout,
        );
        let (stop_tx, stop_rx) = oneshot::channel();

        let runner = SessionLoop {
            shared: self.shared.clone(),
            surface: Arc::clone(&self.surface),
            compositor: self.settings.compositor.clone(),
            client,
            min_interval: self.settings.min_interval,
            degraded_probe_interval: self.settings.degraded_probe_interval,
            last_submit: None,
            applied: None,
        };
        let task = runtime.spawn(run_session(
            session_id.clone(),
            handle,
            outcomes,
            stop_rx,
            runner,
        ));

        self.shared.session.send_replace(Some(session_id.clone()));
        self.session = Some(Session {
            id: session_id,
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Stop the session
    ///
    /// Cancels in-flight inference and releases the device. When this
    /// returns no further frame, detection or present happens. Calling it
    /// without an active session is a no-op.
    pub async fn stop(&mut self) -> PipelineResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.shared.session.send_replace(None);

        let _ = session.stop.send(());
        if let Err(e) = session.task.await
            && e.is_panic()
        {
            warn!(session = %session.id, "Session task panicked");
        }

        if self.shared.state().is_active() {
            self.shared.transition(PipelineState::Stopped);
        }
        info!(session = %session.id, "Pipeline session stopped");
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Reader over the frame buffer
    pub fn frames(&self) -> FrameReader {
        self.shared.buffer.reader()
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.buffer.latest()
    }

    /// Latest applied detection
    pub fn latest_detection(&self) -> Option<Detection> {
        self.shared.detection.borrow().clone()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.shared.stats
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Point-in-time status
    pub fn status(&self) -> StatusSnapshot {
        self.status_handle().snapshot()
    }

    /// Status reader that can move to other threads
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            shared: self.shared.clone(),
            source: self.source_name.clone(),
            backend: self.backend.name().to_string(),
        }
    }
}

/// Cloneable, thread-safe view of a controller's status
#[derive(Clone)]
pub struct StatusHandle {
    shared: Shared,
    source: String,
    backend: String,
}

impl StatusHandle {
    pub fn snapshot(&self) -> StatusSnapshot {
        let detection = self.shared.detection.borrow().clone();
        let top = detection.as_ref().and_then(Detection::top_object);

        StatusSnapshot {
            session_id: self.shared.session.borrow().clone(),
            state: self.shared.state(),
            source: self.source.clone(),
            backend: self.backend.clone(),
            latest_frame: self.shared.buffer.latest_sequence(),
            latest_detection: detection.as_ref().map(|d| d.sequence),
            label: top.map(|o| o.label.clone()),
            confidence: top.map(|o| o.confidence),
            timestamp: chrono::Local::now().to_rfc3339(),
            counters: self.shared.stats.counters(),
        }
    }
}

/// Per-session loop state
struct SessionLoop {
    shared: Shared,
    surface: Arc<dyn RenderSurface>,
    compositor: OverlayCompositor,
    client: InferenceClient,
    min_interval: Duration,
    degraded_probe_interval: Duration,
    last_submit: Option<Instant>,
    /// Latest accepted detection
    applied: Option<Detection>,
}

async fn run_session(
    id: String,
    mut handle: CaptureHandle,
    mut outcomes: mpsc::UnboundedReceiver<InferenceOutcome>,
    mut stop: oneshot::Receiver<()>,
    mut runner: SessionLoop,
) {
    debug!(session = %id, source = handle.source(), "Session task running");

    let mut drops = DropTracker::default();
    let mut lost = None;

    loop {
        tokio::select! {
            biased;

            // Explicit stop, or the controller was dropped
            _ = &mut stop => break,

            event = handle.next_event() => match event {
                Some(CaptureEvent::Frame(frame)) => {
                    drops.sync(&handle, &runner.shared.stats);
                    runner.on_frame(frame);
                }
                Some(CaptureEvent::Lost(error)) => {
                    lost = Some(error);
                    break;
                }
                None => {
                    lost = Some(DeviceError::Disconnected("capture stream ended".to_string()));
                    break;
                }
            },

            Some(outcome) = outcomes.recv() => runner.on_outcome(outcome),
        }
    }

    if let Some(sequence) = runner.client.cancel() {
        debug!(session = %id, sequence, "Cancelled in-flight inference");
    }
    drop(outcomes);

    // Joining the capture thread blocks; keep it off the async workers
    let stats = Arc::clone(&runner.shared.stats);
    let closed = tokio::task::spawn_blocking(move || {
        handle.close();
        drops.sync(&handle, &stats);
    })
    .await;
    if let Err(e) = closed {
        warn!(session = %id, error = %e, "Failed to close capture handle");
    }

    // Reported only once the device is released, so a restart can reopen it
    if let Some(error) = lost {
        runner.on_device_lost(error);
    }
    debug!(session = %id, "Session task finished");
}

/// Folds a handle's drop count into the controller-wide counter
#[derive(Debug, Default)]
struct DropTracker {
    synced: u64,
}

impl DropTracker {
    fn sync(&mut self, handle: &CaptureHandle, stats: &PipelineStats) {
        let total = handle.dropped_frames();
        stats.record_dropped(total.saturating_sub(self.synced));
        self.synced = total;
    }
}

impl SessionLoop {
    fn on_frame(&mut self, frame: Frame) {
        let frame = Arc::new(frame);
        let stats = &self.shared.stats;
        stats.record_frame(frame.captured_at);

        if !self.shared.buffer.publish(Arc::clone(&frame)) {
            stats.record_rejected();
            return;
        }

        if self.shared.state() == PipelineState::Starting {
            self.shared.transition(PipelineState::Running);
        }
        self.shared.emit(PipelineEvent::Frame {
            sequence: frame.sequence,
            timestamp_ms: frame.timestamp_ms,
        });

        let composite = self.compositor.compose(&frame, self.applied.as_ref());
        stats.record_presented(composite.is_suppressed());
        self.surface.present(composite);

        self.maybe_submit(frame);
    }

    fn maybe_submit(&mut self, frame: Arc<Frame>) {
        if self.client.is_busy() {
            self.shared.stats.record_busy();
            return;
        }

        let spacing = if self.shared.state() == PipelineState::Degraded {
            self.min_interval.max(self.degraded_probe_interval)
        } else {
            self.min_interval
        };
        if let Some(last) = self.last_submit
            && last.elapsed() < spacing
        {
            return;
        }

        match self.client.submit(frame) {
            Ok(_) => {
                self.shared.stats.record_submitted();
                self.last_submit = Some(Instant::now());
            }
            Err(InferenceError::Busy { .. }) => self.shared.stats.record_busy(),
            Err(e) => warn!(error = %e, "Failed to submit frame for inference"),
        }
    }

    fn on_outcome(&mut self, outcome: InferenceOutcome) {
        let Some(outcome) = self.client.accept(outcome) else {
            return;
        };
        let stats = &self.shared.stats;
        stats.record_attempts(outcome.attempts());

        match outcome {
            InferenceOutcome::Completed { detection, .. } => {
                if self.shared.state() == PipelineState::Degraded {
                    self.shared.transition(PipelineState::Running);
                }

                let newer = self
                    .applied
                    .as_ref()
                    .is_none_or(|current| detection.sequence > current.sequence);
                stats.record_detection(newer);
                if !newer {
                    debug!(sequence = detection.sequence, "Discarding out-of-date detection");
                    return;
                }

                self.applied = Some(detection.clone());
                self.shared.detection.send_replace(Some(detection.clone()));
                self.shared.emit(PipelineEvent::Detection(detection));
            }
            InferenceOutcome::Failed {
                sequence,
                error,
                attempts,
                ..
            } => {
                if matches!(error, InferenceError::InvalidResponse(_)) {
                    stats.record_invalid();
                } else {
                    stats.record_failed();
                    if self.shared.state() == PipelineState::Running {
                        warn!(sequence, attempts, error = %error, "Inference degraded");
                        self.shared.transition(PipelineState::Degraded);
                    }
                }
                self.shared.emit(PipelineEvent::InferenceFailed {
                    sequence,
                    error,
                    attempts,
                });
            }
        }
    }

    fn on_device_lost(&mut self, error: DeviceError) {
        warn!(error = %error, "Capture device lost, failing session");
        self.shared.transition(PipelineState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::ManualSource;
    use crate::backends::inference::ThresholdDetector;
    use crate::backends::camera::{CaptureLoopController, FrameDelivery, LoopAction};
    use crate::pipeline::render::NullSurface;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Set when the capture thread's state is dropped
    struct Released(Arc<AtomicBool>);

    impl Drop for Released {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Reports device loss right away, then idles until stopped
    struct LosingSource {
        released: Arc<AtomicBool>,
    }

    impl FrameSource for LosingSource {
        fn describe(&self) -> String {
            "losing".to_string()
        }

        fn open(&mut self, _format: &CaptureFormat) -> Result<CaptureHandle, DeviceError> {
            self.released.store(false, Ordering::SeqCst);
            let released = Arc::clone(&self.released);
            let (delivery, receiver) = FrameDelivery::slot("losing");
            let worker = CaptureLoopController::start(
                "losing",
                delivery,
                move || Ok((Released(released), false)),
                |state: &mut (Released, bool), delivery: &mut FrameDelivery| {
                    if !state.1 {
                        state.1 = true;
                        delivery.lost(DeviceError::Disconnected("gone".into()));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                    LoopAction::Continue
                },
            );
            Ok(CaptureHandle::new(self.describe(), receiver, Some(worker)))
        }
    }

    fn controller() -> (PipelineController, crate::backends::camera::FrameInjector) {
        let (source, injector) = ManualSource::new();
        let controller = PipelineController::new(
            Box::new(source),
            Arc::new(ThresholdDetector::default()),
            Arc::new(NullSurface),
            PipelineSettings::default(),
        );
        (controller, injector)
    }

    #[test]
    fn test_start_without_runtime() {
        let (mut controller, _) = controller();
        assert_eq!(controller.start(), Err(PipelineError::NoRuntime));
        assert_eq!(controller.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_double_start_is_invalid() {
        let (mut controller, _) = controller();
        controller.start().unwrap();
        assert_eq!(
            controller.start(),
            Err(PipelineError::InvalidTransition {
                from: PipelineState::Starting,
                to: PipelineState::Starting,
            })
        );
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (mut controller, _) = controller();
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_open_failure_fails_pipeline() {
        let mut controller = PipelineController::new(
            Box::new(crate::backends::camera::SyntheticSource::new()),
            Arc::new(ThresholdDetector::default()),
            Arc::new(NullSurface),
            PipelineSettings {
                format: CaptureFormat::new(0, 0, 30),
                ..Default::default()
            },
        );
        assert!(matches!(
            controller.start(),
            Err(PipelineError::Device(DeviceError::Unavailable(_)))
        ));
        assert_eq!(controller.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_device_released_before_failed() {
        let released = Arc::new(AtomicBool::new(false));
        let mut controller = PipelineController::new(
            Box::new(LosingSource {
                released: Arc::clone(&released),
            }),
            Arc::new(ThresholdDetector::default()),
            Arc::new(NullSurface),
            PipelineSettings::default(),
        );
        let mut state = controller.watch_state();

        for _ in 0..2 {
            controller.start().unwrap();
            state
                .wait_for(|s| *s == PipelineState::Failed)
                .await
                .unwrap();
            assert!(released.load(Ordering::SeqCst));
        }
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_status_reports_session() {
        let (mut controller, injector) = controller();
        let mut state = controller.watch_state();
        controller.start().unwrap();
        injector.push_solid(4, 4, [0, 0, 0, 255]);
        state
            .wait_for(|s| *s == PipelineState::Running)
            .await
            .unwrap();

        let status = controller.status();
        assert_eq!(status.state, PipelineState::Running);
        assert!(status.session_id.is_some());
        assert_eq!(status.latest_frame, Some(1));
        controller.stop().await.unwrap();
    }
}
