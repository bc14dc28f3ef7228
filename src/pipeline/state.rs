// SPDX-License-Identifier: MPL-2.0

//! Pipeline lifecycle state machine

use serde::Serialize;
use std::fmt;

/// Lifecycle state of one pipeline session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Never started
    #[default]
    Idle,
    /// Source opened, waiting for the first frame
    Starting,
    /// Frames flowing and inference healthy
    Running,
    /// Frames flowing, inference retry budget exhausted
    Degraded,
    /// Stopped by the caller
    Stopped,
    /// Unrecoverable device error; terminal until the next start
    Failed,
}

impl PipelineState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle | Stopped | Failed, Starting)
                | (Starting, Running | Stopped)
                | (Running, Degraded | Stopped)
                | (Degraded, Running | Stopped)
                | (Idle | Starting | Running | Degraded | Stopped, Failed)
        )
    }

    /// A session is active (between a successful start and stop/failure)
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PipelineState::Starting | PipelineState::Running | PipelineState::Degraded
        )
    }

    /// Frames are flowing
    pub fn is_streaming(self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Degraded => "degraded",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
