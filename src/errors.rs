// SPDX-License-Identifier: MPL-2.0

//! Error types for the vision monitor pipeline

use crate::pipeline::state::PipelineState;
use std::fmt;
use std::time::Duration;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Top-level pipeline error
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Capture device errors (fatal to the session)
    Device(DeviceError),
    /// Inference errors (absorbed by the pipeline, surfaced only to callers of the client)
    Inference(InferenceError),
    /// Configuration errors
    Config(ConfigError),
    /// Requested lifecycle operation is not valid from the current state
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    /// Pipeline operations need a Tokio runtime
    NoRuntime,
}

/// Capture device errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No device at the requested path, or it could not be opened
    Unavailable(String),
    /// The process is not allowed to open the device
    PermissionDenied(String),
    /// Device went away or stopped producing frames mid-session
    Disconnected(String),
}

/// Inference errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// A request is already in flight
    Busy { in_flight: u64 },
    /// The backend did not answer within the request timeout
    Timeout(Duration),
    /// Backend transport failed (connection, process I/O, backend-reported error)
    Transport(String),
    /// Backend answered with data that cannot be turned into a detection
    InvalidResponse(String),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Reading or writing the config file failed
    Io(String),
    /// Config file is not valid JSON for the schema
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

impl DeviceError {
    /// Map an I/O error from opening a device node
    pub fn from_open_error(path: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                DeviceError::PermissionDenied(format!("{}: {}", path, err))
            }
            _ => DeviceError::Unavailable(format!("{}: {}", path, err)),
        }
    }
}

impl InferenceError {
    /// Timeouts and transport failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Timeout(_) | InferenceError::Transport(_))
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Device(e) => write!(f, "Device error: {}", e),
            PipelineError::Inference(e) => write!(f, "Inference error: {}", e),
            PipelineError::Config(e) => write!(f, "Configuration error: {}", e),
            PipelineError::InvalidTransition { from, to } => {
                write!(f, "Invalid pipeline transition: {} -> {}", from, to)
            }
            PipelineError::NoRuntime => write!(f, "No Tokio runtime available"),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Unavailable(msg) => write!(f, "Device unavailable: {}", msg),
            DeviceError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            DeviceError::Disconnected(msg) => write!(f, "Device disconnected: {}", msg),
        }
    }
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::Busy { in_flight } => {
                write!(f, "Inference busy (frame {} in flight)", in_flight)
            }
            InferenceError::Timeout(after) => {
                write!(f, "Inference timed out after {} ms", after.as_millis())
            }
            InferenceError::Transport(msg) => write!(f, "Transport error: {}", msg),
            InferenceError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid value: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}
impl std::error::Error for DeviceError {}
impl std::error::Error for InferenceError {}
impl std::error::Error for ConfigError {}

impl From<DeviceError> for PipelineError {
    fn from(err: DeviceError) -> Self {
        PipelineError::Device(err)
    }
}

impl From<InferenceError> for PipelineError {
    fn from(err: InferenceError) -> Self {
        PipelineError::Inference(err)
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
