// SPDX-License-Identifier: GPL-3.0-only

//! Inference client
//!
//! Keeps at most one request in flight against an [`InferenceBackend`].
//! `submit` never waits: it spawns the request and returns, or reports
//! `Busy`. Each request runs its attempts (timeout, retry with backoff and
//! jitter) on its own task and reports exactly one [`InferenceOutcome`].
//!
//! Outcomes carry the request id they belong to. The owner hands each one
//! back through [`InferenceClient::accept`], which only lets through the
//! outcome of the request currently in flight; anything from a cancelled
//! request is discarded there.

use crate::backends::camera::types::Frame;
use crate::backends::inference::{InferenceBackend, InferenceRequest};
use crate::config::InferenceConfig;
use crate::constants::inference as defaults;
use crate::errors::InferenceError;
use crate::pipeline::types::Detection;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Backoff schedule for transient failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first
    pub budget: u32,
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Fraction of each delay that is randomized (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: defaults::DEFAULT_RETRY_BUDGET,
            base: defaults::DEFAULT_BACKOFF_BASE,
            max: defaults::DEFAULT_BACKOFF_MAX,
            jitter: defaults::DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            budget: config.retry_budget,
            base: config.backoff_base(),
            max: config.backoff_max(),
            jitter: config.jitter,
        }
    }

    /// No retries, no delay
    pub fn no_retry() -> Self {
        Self {
            budget: 1,
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay after `failures` failed attempts (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay after `failures` failed attempts, with jitter applied
    ///
    /// The result lies in `[backoff * (1 - jitter), backoff]`.
    pub fn delay_for<R: Rng>(&self, failures: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(failures);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 - jitter * rng.random_range(0.0..1.0);
        delay.mul_f64(factor)
    }

    fn attempts(&self) -> u32 {
        self.budget.max(1)
    }
}

/// Final result of one request
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    Completed {
        request_id: u64,
        detection: Detection,
    },
    Failed {
        request_id: u64,
        sequence: u64,
        error: InferenceError,
        attempts: u32,
    },
}

impl InferenceOutcome {
    pub fn request_id(&self) -> u64 {
        match self {
            InferenceOutcome::Completed { request_id, .. }
            | InferenceOutcome::Failed { request_id, .. } => *request_id,
        }
    }

    /// Sequence of the frame the request was for
    pub fn sequence(&self) -> u64 {
        match self {
            InferenceOutcome::Completed { detection, .. } => detection.sequence,
            InferenceOutcome::Failed { sequence, .. } => *sequence,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            InferenceOutcome::Completed { detection, .. } => detection.attempts,
            InferenceOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// The single outstanding request
#[derive(Debug)]
struct InFlightRequest {
    sequence: u64,
    request_id: u64,
    submitted_at: Instant,
    abort: AbortHandle,
}

/// Single-flight inference client
pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    policy: RetryPolicy,
    timeout: Duration,
    outcomes: mpsc::UnboundedSender<InferenceOutcome>,
    in_flight: Option<InFlightRequest>,
    next_request_id: u64,
}

impl InferenceClient {
    /// Create a client and the receiver its outcomes arrive on
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<InferenceOutcome>) {
        let (outcomes, receiver) = mpsc::unbounded_channel();
        info!(
            backend = backend.name(),
            budget = policy.budget,
            timeout_ms = timeout.as_millis() as u64,
            "Inference client created"
        );
        (
            Self {
                backend,
                policy,
                timeout,
                outcomes,
                in_flight: None,
                next_request_id: 1,
            },
            receiver,
        )
    }

    /// Create a client from configuration
    pub fn from_config(
        backend: Arc<dyn InferenceBackend>,
        config: &InferenceConfig,
    ) -> (Self, mpsc::UnboundedReceiver<InferenceOutcome>) {
        Self::new(backend, RetryPolicy::from_config(config), config.timeout())
    }

    /// Start inference on `frame`
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Returns
    /// * `Ok(sequence)` - Request started for this frame
    /// * `Err(InferenceError::Busy)` - Another request is still in flight
    pub fn submit(&mut self, frame: Arc<Frame>) -> Result<u64, InferenceError> {
        if let Some(current) = &self.in_flight {
            return Err(InferenceError::Busy {
                in_flight: current.sequence,
            });
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let sequence = frame.sequence;
        let submitted_at = Instant::now();

        let task = tokio::spawn(run_request(
            Arc::clone(&self.backend),
            InferenceRequest::new(frame),
            self.policy,
            self.timeout,
            request_id,
            submitted_at,
            self.outcomes.clone(),
        ));

        trace!(sequence, request_id, "Inference submitted");
        self.in_flight = Some(InFlightRequest {
            sequence,
            request_id,
            submitted_at,
            abort: task.abort_handle(),
        });
        Ok(sequence)
    }

    /// Match an outcome against the request in flight
    ///
    /// Returns the outcome and frees the client if it belongs to the current
    /// request; returns `None` for outcomes of cancelled requests.
    pub fn accept(&mut self, outcome: InferenceOutcome) -> Option<InferenceOutcome> {
        match &self.in_flight {
            Some(current) if current.request_id == outcome.request_id() => {
                self.in_flight = None;
                Some(outcome)
            }
            _ => {
                debug!(
                    request_id = outcome.request_id(),
                    sequence = outcome.sequence(),
                    "Discarding outcome of cancelled request"
                );
                None
            }
        }
    }

    /// Abort the in-flight request, if any
    ///
    /// Returns the sequence of the frame whose request was cancelled. Its
    /// outcome, should it race the abort, is rejected by `accept`.
    pub fn cancel(&mut self) -> Option<u64> {
        let current = self.in_flight.take()?;
        current.abort.abort();
        debug!(
            sequence = current.sequence,
            request_id = current.request_id,
            elapsed_ms = current.submitted_at.elapsed().as_millis() as u64,
            "Inference cancelled"
        );
        Some(current.sequence)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Sequence of the frame currently being processed
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|r| r.sequence)
    }

    /// Request id of the request currently in flight
    pub fn in_flight_request_id(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|r| r.request_id)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Drop for InferenceClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run all attempts of one request and report the outcome
async fn run_request(
    backend: Arc<dyn InferenceBackend>,
    request: InferenceRequest,
    policy: RetryPolicy,
    timeout: Duration,
    request_id: u64,
    submitted_at: Instant,
    outcomes: mpsc::UnboundedSender<InferenceOutcome>,
) {
    let sequence = request.sequence;
    let mut attempt = 0;

    let outcome = loop {
        attempt += 1;

        let result = match tokio::time::timeout(timeout, backend.infer(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout(timeout)),
        };

        let error = match result.and_then(|response| response.validate(sequence)) {
            Ok(objects) => {
                let detection = Detection {
                    sequence,
                    objects,
                    latency: submitted_at.elapsed(),
                    attempts: attempt,
                };
                trace!(
                    sequence,
                    attempt,
                    objects = detection.objects.len(),
                    latency_ms = detection.latency.as_millis() as u64,
                    "Inference completed"
                );
                break InferenceOutcome::Completed {
                    request_id,
                    detection,
                };
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            warn!(sequence, error = %error, "Discarding invalid inference response");
            break InferenceOutcome::Failed {
                request_id,
                sequence,
                error,
                attempts: attempt,
            };
        }

        if attempt >= policy.attempts() {
            warn!(sequence, attempts = attempt, error = %error, "Inference retry budget exhausted");
            break InferenceOutcome::Failed {
                request_id,
                sequence,
                error,
                attempts: attempt,
            };
        }

        let delay = policy.delay_for(attempt, &mut rand::rng());
        debug!(
            sequence,
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Inference attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    };

    // Receiver gone means the session ended; nothing left to tell
    let _ = outcomes.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::inference::InferenceResponse;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back a fixed list of results, then answers with empty detections
    struct Scripted {
        script: Mutex<VecDeque<Result<(), InferenceError>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<Result<(), InferenceError>>) -> Arc<Self> {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay(script: Vec<Result<(), InferenceError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay,
            })
        }
    }

    impl InferenceBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn infer(
            &self,
            request: InferenceRequest,
        ) -> BoxFuture<'static, Result<InferenceResponse, InferenceError>> {
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                next.map(|()| InferenceResponse::new(request.sequence, Vec::new()))
            }
            .boxed()
        }
    }

    fn frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame::solid(sequence, 2, 2, [0, 0, 0, 255]))
    }

    fn fast_policy(budget: u32) -> RetryPolicy {
        RetryPolicy {
            budget,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            jitter: 0.5,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            budget: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: 0.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            budget: 3,
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.5,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for failures in 1..=4 {
            let full = policy.backoff(failures);
            for _ in 0..50 {
                let delay = policy.delay_for(failures, &mut rng);
                assert!(delay <= full);
                assert!(delay >= full.mul_f64(0.5));
            }
        }
    }

    #[tokio::test]
    async fn test_second_submit_is_busy() {
        let backend = Scripted::with_delay(Vec::new(), Duration::from_millis(50));
        let (mut client, mut outcomes) = InferenceClient::new(backend, fast_policy(1), Duration::from_secs(1));

        assert_eq!(client.submit(frame(1)), Ok(1));
        assert_eq!(
            client.submit(frame(2)),
            Err(InferenceError::Busy { in_flight: 1 })
        );

        let outcome = outcomes.recv().await.unwrap();
        let outcome = client.accept(outcome).unwrap();
        assert_eq!(outcome.sequence(), 1);
        assert!(!client.is_busy());
        assert_eq!(client.submit(frame(2)), Ok(2));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let backend = Scripted::new(vec![
            Err(InferenceError::Transport("reset".into())),
            Err(InferenceError::Transport("reset".into())),
        ]);
        let (mut client, mut outcomes) = InferenceClient::new(backend, fast_policy(3), Duration::from_secs(1));
        client.submit(frame(5)).unwrap();

        match client.accept(outcomes.recv().await.unwrap()) {
            Some(InferenceOutcome::Completed { detection, .. }) => {
                assert_eq!(detection.sequence, 5);
                assert_eq!(detection.attempts, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_budget() {
        let backend = Scripted::with_delay(Vec::new(), Duration::from_millis(200));
        let (mut client, mut outcomes) =
            InferenceClient::new(backend, fast_policy(3), Duration::from_millis(10));
        client.submit(frame(1)).unwrap();

        match client.accept(outcomes.recv().await.unwrap()) {
            Some(InferenceOutcome::Failed {
                error, attempts, ..
            }) => {
                assert!(matches!(error, InferenceError::Timeout(_)));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_response_is_not_retried() {
        let backend = Scripted::new(vec![Err(InferenceError::InvalidResponse("junk".into()))]);
        let (mut client, mut outcomes) = InferenceClient::new(backend, fast_policy(3), Duration::from_secs(1));
        client.submit(frame(1)).unwrap();

        let outcome = client.accept(outcomes.recv().await.unwrap()).unwrap();
        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(
            outcome,
            InferenceOutcome::Failed {
                error: InferenceError::InvalidResponse(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_request_never_completes() {
        let backend = Scripted::with_delay(Vec::new(), Duration::from_millis(30));
        let (mut client, mut outcomes) = InferenceClient::new(backend, fast_policy(1), Duration::from_secs(1));

        client.submit(frame(7)).unwrap();
        assert_eq!(client.cancel(), Some(7));
        assert!(!client.is_busy());

        let waited = tokio::time::timeout(Duration::from_millis(100), outcomes.recv()).await;
        assert!(waited.is_err(), "aborted request produced an outcome");
    }

    #[tokio::test]
    async fn test_stale_outcome_is_rejected() {
        let backend = Scripted::new(Vec::new());
        let (mut client, _outcomes) = InferenceClient::new(backend, fast_policy(1), Duration::from_secs(1));
        client.submit(frame(3)).unwrap();

        let stale = InferenceOutcome::Failed {
            request_id: 999,
            sequence: 2,
            error: InferenceError::Timeout(Duration::from_millis(1)),
            attempts: 1,
        };
        assert!(client.accept(stale).is_none());
        assert!(client.is_busy());
    }
}
