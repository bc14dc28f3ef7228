// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end pipeline scenarios
//!
//! Frames come from a `ManualSource`, detections from a backend whose
//! requests the test answers by hand, and composites are recorded as they
//! are presented, so every scenario controls exactly what is in flight.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use vision_monitor::backends::camera::manual::PushOutcome;
use vision_monitor::backends::camera::{FrameInjector, ManualSource};
use vision_monitor::backends::inference::{
    InferenceBackend, InferenceRequest, InferenceResponse,
};
use vision_monitor::errors::InferenceError;
use vision_monitor::pipeline::{
    BoundingBox, Composite, DetectedObject, Overlay, PipelineController, PipelineEvent,
    PipelineSettings, PipelineState, RenderSurface, RetryPolicy, Suppression,
};

const WAIT: Duration = Duration::from_secs(5);

/// A request the test has not answered yet
struct Pending {
    sequence: u64,
    reply: oneshot::Sender<Result<InferenceResponse, InferenceError>>,
}

impl Pending {
    fn answer(self, objects: Vec<DetectedObject>) {
        let _ = self
            .reply
            .send(Ok(InferenceResponse::new(self.sequence, objects)));
    }

    fn reply(self, response: Result<InferenceResponse, InferenceError>) {
        let _ = self.reply.send(response);
    }
}

/// Backend that parks every request until the test answers it
struct Gated {
    requests: mpsc::UnboundedSender<Pending>,
}

impl InferenceBackend for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    fn infer(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'static, Result<InferenceResponse, InferenceError>> {
        let (reply, answer) = oneshot::channel();
        let _ = self.requests.send(Pending {
            sequence: request.sequence,
            reply,
        });
        async move {
            answer
                .await
                .unwrap_or_else(|_| Err(InferenceError::Transport("request dropped".into())))
        }
        .boxed()
    }
}

/// Surface that forwards every presented composite to the test
struct Recorder(mpsc::UnboundedSender<Composite>);

impl RenderSurface for Recorder {
    fn present(&self, composite: Composite) {
        let _ = self.0.send(composite);
    }
}

struct Harness {
    controller: PipelineController,
    injector: FrameInjector,
    requests: mpsc::UnboundedReceiver<Pending>,
    composites: mpsc::UnboundedReceiver<Composite>,
    events: broadcast::Receiver<PipelineEvent>,
}

impl Harness {
    fn new(settings: PipelineSettings) -> Self {
        let (source, injector) = ManualSource::new();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (composites_tx, composites) = mpsc::unbounded_channel();
        let controller = PipelineController::new(
            Box::new(source),
            Arc::new(Gated {
                requests: requests_tx,
            }),
            Arc::new(Recorder(composites_tx)),
            settings,
        );
        let events = controller.subscribe();
        Self {
            controller,
            injector,
            requests,
            composites,
            events,
        }
    }

    /// Push a frame and wait until its composite is presented
    async fn push(&mut self) -> Composite {
        let outcome = self.injector.push_solid(8, 8, [10, 10, 10, 255]);
        assert!(matches!(outcome, PushOutcome::Delivered(_)), "{outcome:?}");
        self.presented().await
    }

    async fn presented(&mut self) -> Composite {
        tokio::time::timeout(WAIT, self.composites.recv())
            .await
            .expect("composite not presented")
            .expect("surface closed")
    }

    async fn next_request(&mut self) -> Pending {
        tokio::time::timeout(WAIT, self.requests.recv())
            .await
            .expect("no inference request")
            .expect("backend dropped")
    }

    async fn wait_event(&mut self, pred: impl Fn(&PipelineEvent) -> bool) -> PipelineEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("events closed"),
                }
            }
        })
        .await
        .expect("event not observed")
    }

    async fn wait_detection(&mut self, sequence: u64) {
        self.wait_event(|e| matches!(e, PipelineEvent::Detection(d) if d.sequence == sequence))
            .await;
    }

    async fn wait_state(&self, state: PipelineState) {
        let mut watch = self.controller.watch_state();
        tokio::time::timeout(WAIT, watch.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        timeout: Duration::from_secs(30),
        min_interval: Duration::ZERO,
        degraded_probe_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn person() -> DetectedObject {
    DetectedObject::new("person", 0.9, BoundingBox::new(0.25, 0.25, 0.5, 0.5))
}

fn detection_sequence(composite: &Composite) -> Option<u64> {
    match &composite.overlay {
        Overlay::Boxes {
            detection_sequence, ..
        } => Some(*detection_sequence),
        _ => None,
    }
}

#[tokio::test]
async fn test_single_request_in_flight() {
    let mut h = Harness::new(settings());
    h.controller.start().unwrap();

    let first = h.push().await;
    assert_eq!(first.sequence(), 1);
    assert_eq!(first.overlay, Overlay::None);
    h.wait_state(PipelineState::Running).await;

    let pending = h.next_request().await;
    assert_eq!(pending.sequence, 1);

    // Frames keep flowing while inference is busy, and none is submitted
    for expected in 2..=4 {
        let composite = h.push().await;
        assert_eq!(composite.sequence(), expected);
        assert_eq!(composite.overlay, Overlay::None);
    }
    assert!(h.requests.try_recv().is_err());
    assert_eq!(h.controller.stats().counters().inference_busy, 3);

    // Once answered, the next frame is submitted and carries the boxes
    pending.answer(vec![person()]);
    h.wait_detection(1).await;

    let composite = h.push().await;
    assert_eq!(composite.sequence(), 5);
    assert_eq!(detection_sequence(&composite), Some(1));
    assert_eq!(composite.top_object().map(|o| o.label.as_str()), Some("person"));
    assert_eq!(h.next_request().await.sequence, 5);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_detection_is_suppressed_until_fresh_one_arrives() {
    let mut h = Harness::new(settings());
    h.controller.start().unwrap();

    h.push().await;
    h.next_request().await.answer(vec![person()]);
    h.wait_detection(1).await;

    // Request for frame 2 stays open while frames 3..=7 arrive
    h.push().await;
    let slow = h.next_request().await;
    assert_eq!(slow.sequence, 2);

    for _ in 3..=6 {
        let composite = h.push().await;
        assert_eq!(detection_sequence(&composite), Some(1));
    }
    let stale = h.push().await;
    assert_eq!(stale.sequence(), 7);
    assert_eq!(
        stale.overlay,
        Overlay::Suppressed {
            detection_sequence: 1,
            reason: Suppression::Stale { lag: 6 },
        }
    );
    assert!(stale.objects().is_empty());

    slow.answer(vec![person()]);
    h.wait_detection(2).await;

    let fresh = h.push().await;
    assert_eq!(fresh.sequence(), 8);
    assert_eq!(detection_sequence(&fresh), Some(2));

    let counters = h.controller.stats().counters();
    assert_eq!(counters.overlays_suppressed, 1);
    assert_eq!(counters.detections_applied, 2);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_with_pending_request_is_silent() {
    let mut h = Harness::new(settings());
    h.controller.start().unwrap();

    for sequence in 1..=6 {
        h.push().await;
        let pending = h.next_request().await;
        assert_eq!(pending.sequence, sequence);
        pending.answer(vec![person()]);
        h.wait_detection(sequence).await;
    }

    h.push().await;
    let pending = h.next_request().await;
    assert_eq!(pending.sequence, 7);

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), PipelineState::Stopped);

    // Answering now reaches nobody, and the source is closed
    pending.answer(vec![person()]);
    assert_eq!(
        h.injector.push_solid(8, 8, [0, 0, 0, 255]),
        PushOutcome::NotOpen
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.controller.latest_detection().map(|d| d.sequence), Some(6));
    assert!(h.composites.try_recv().is_err());

    let mut saw_stopped = false;
    while let Ok(event) = h.events.try_recv() {
        match event {
            PipelineEvent::StateChanged {
                to: PipelineState::Stopped,
                ..
            } => saw_stopped = true,
            PipelineEvent::Detection(d) => assert_ne!(d.sequence, 7),
            other => assert!(!saw_stopped, "event after stop: {other:?}"),
        }
    }
    assert!(saw_stopped);
}

#[tokio::test]
async fn test_repeated_timeouts_degrade_then_recover() {
    let mut h = Harness::new(PipelineSettings {
        timeout: Duration::from_millis(50),
        retry: RetryPolicy {
            budget: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            jitter: 0.5,
        },
        ..settings()
    });
    h.controller.start().unwrap();

    h.push().await;

    // Three attempts for the same frame, none answered
    let mut unanswered = Vec::new();
    for _ in 0..3 {
        let pending = h.next_request().await;
        assert_eq!(pending.sequence, 1);
        unanswered.push(pending);
    }

    let failed = h
        .wait_event(|e| matches!(e, PipelineEvent::InferenceFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        PipelineEvent::InferenceFailed {
            sequence: 1,
            error: InferenceError::Timeout(_),
            attempts: 3,
        }
    ));
    h.wait_state(PipelineState::Degraded).await;

    // Frames are still presented while degraded
    let composite = h.push().await;
    assert_eq!(composite.sequence(), 2);

    h.next_request().await.answer(Vec::new());
    h.wait_state(PipelineState::Running).await;

    let counters = h.controller.stats().counters();
    assert_eq!(counters.inference_failed, 1);
    assert_eq!(counters.inference_retried, 2);
    drop(unanswered);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_response_keeps_running() {
    let mut h = Harness::new(settings());
    h.controller.start().unwrap();

    h.push().await;
    // Answer for the wrong frame
    h.next_request()
        .await
        .reply(Ok(InferenceResponse::new(99, vec![person()])));

    let failed = h
        .wait_event(|e| matches!(e, PipelineEvent::InferenceFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        PipelineEvent::InferenceFailed {
            error: InferenceError::InvalidResponse(_),
            ..
        }
    ));
    assert_eq!(h.controller.state(), PipelineState::Running);
    assert_eq!(h.controller.latest_detection(), None);
    assert_eq!(h.controller.stats().counters().inference_invalid, 1);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_device_loss_fails_and_restart_recovers() {
    let mut h = Harness::new(settings());
    h.controller.start().unwrap();

    h.push().await;
    h.wait_state(PipelineState::Running).await;

    assert!(h.injector.disconnect("unplugged"));
    h.wait_state(PipelineState::Failed).await;
    assert!(!h.injector.is_open());

    // Stop after failure leaves the state alone
    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), PipelineState::Failed);

    h.controller.start().unwrap();
    let composite = h.push().await;
    assert_eq!(composite.sequence(), 1);
    h.wait_state(PipelineState::Running).await;

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), PipelineState::Stopped);
}

#[tokio::test]
async fn test_burst_presents_newest_and_counts_drops_across_sessions() {
    let mut h = Harness::new(settings());
    h.controller.start().unwrap();

    // The session task cannot run between these pushes
    assert_eq!(h.injector.push_solid(8, 8, [1; 4]), PushOutcome::Delivered(1));
    assert_eq!(
        h.injector.push_solid(8, 8, [2; 4]),
        PushOutcome::Replaced {
            sequence: 2,
            dropped: 1
        }
    );
    assert_eq!(
        h.injector.push_solid(8, 8, [3; 4]),
        PushOutcome::Replaced {
            sequence: 3,
            dropped: 2
        }
    );
    assert_eq!(h.presented().await.sequence(), 3);
    assert_eq!(h.controller.stats().counters().frames_dropped, 2);
    h.controller.stop().await.unwrap();

    // Second session: a drop after the last presented frame still counts
    h.controller.start().unwrap();
    assert_eq!(h.push().await.sequence(), 1);
    h.injector.push_solid(8, 8, [4; 4]);
    assert!(matches!(
        h.injector.push_solid(8, 8, [5; 4]),
        PushOutcome::Replaced { dropped: 2, .. }
    ));
    h.controller.stop().await.unwrap();

    let counters = h.controller.stats().counters();
    assert_eq!(counters.frames_dropped, 3);
    assert_eq!(counters.composites_presented, 2);
}
