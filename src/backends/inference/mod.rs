// SPDX-License-Identifier: MPL-2.0

//! Inference backends
//!
//! A backend turns one frame into a list of detected objects. It is an
//! opaque capability: the pipeline only needs [`InferenceBackend::infer`],
//! and treats timeouts, retries and cancellation itself.
//!
//! - [`ThresholdDetector`]: in-process luminance blob detector
//! - [`ProcessBackend`]: external detector process over stdio

pub mod process;
pub mod threshold;

pub use process::ProcessBackend;
pub use threshold::ThresholdDetector;

use crate::backends::camera::types::Frame;
use crate::config::DetectorSettings;
use crate::errors::InferenceError;
use crate::pipeline::types::DetectedObject;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One frame handed to a backend
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub sequence: u64,
    pub frame: Arc<Frame>,
}

impl InferenceRequest {
    pub fn new(frame: Arc<Frame>) -> Self {
        Self {
            sequence: frame.sequence,
            frame,
        }
    }
}

/// Raw backend answer, not yet validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub sequence: u64,
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
}

/// Wire form of a reply line: either a result or a structured error
#[derive(Deserialize)]
#[serde(untagged)]
enum WireReply {
    Error { error: String },
    Response(InferenceResponse),
}

impl InferenceResponse {
    pub fn new(sequence: u64, objects: Vec<DetectedObject>) -> Self {
        Self { sequence, objects }
    }

    /// Parse one JSON reply line
    ///
    /// `{"error": "..."}` is a backend-reported failure and maps to
    /// `Transport`; anything that is not a well-formed reply is
    /// `InvalidResponse`.
    pub fn from_json(line: &str) -> Result<Self, InferenceError> {
        match serde_json::from_str::<WireReply>(line.trim()) {
            Ok(WireReply::Response(response)) => Ok(response),
            Ok(WireReply::Error { error }) => Err(InferenceError::Transport(error)),
            Err(e) => Err(InferenceError::InvalidResponse(format!(
                "malformed reply: {}",
                e
            ))),
        }
    }

    /// Check the reply belongs to `expected_sequence` and every object is sane
    pub fn validate(self, expected_sequence: u64) -> Result<Vec<DetectedObject>, InferenceError> {
        if self.sequence != expected_sequence {
            return Err(InferenceError::InvalidResponse(format!(
                "reply for frame {} while waiting for frame {}",
                self.sequence, expected_sequence
            )));
        }
        if let Some(reason) = self.objects.iter().find_map(DetectedObject::validation_error) {
            return Err(InferenceError::InvalidResponse(reason));
        }
        Ok(self.objects)
    }
}

/// Something that can detect objects in a frame
///
/// Implementations must be cancel-safe: the returned future may be dropped
/// at any await point (timeout or stop) and the backend must still serve
/// the next request.
pub trait InferenceBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Run detection on one frame
    fn infer(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'static, Result<InferenceResponse, InferenceError>>;
}

/// Build the backend described by the configuration
pub fn backend_from_settings(settings: &DetectorSettings) -> Arc<dyn InferenceBackend> {
    match settings {
        DetectorSettings::Threshold { luma_threshold } => {
            Arc::new(ThresholdDetector::new(*luma_threshold))
        }
        DetectorSettings::Process { command, args } => {
            Arc::new(ProcessBackend::new(command, args.clone()))
        }
    }
}
