// SPDX-License-Identifier: MPL-2.0

//! Frame/inference/overlay pipeline
//!
//! # Components
//!
//! - [`buffer`]: latest-wins frame slot between capture and consumers
//! - [`inference`]: single-flight inference client with retry and backoff
//! - [`compositor`]: pairs frames with detections under the staleness rule
//! - [`render`]: render surface trait and the latest-wins composite slot
//! - [`controller`]: session lifecycle and the steady-state loop
//! - [`state`]: lifecycle state machine
//! - [`stats`]: counters and status snapshots
//! - [`types`]: detection result types

pub mod buffer;
pub mod compositor;
pub mod controller;
pub mod inference;
pub mod render;
pub mod state;
pub mod stats;
pub mod types;

pub use buffer::{FrameBuffer, FrameReader};
pub use compositor::{Composite, Overlay, OverlayCompositor, OverlayStyle, Suppression};
pub use controller::{PipelineController, PipelineEvent, PipelineSettings, StatusHandle};
pub use inference::{InferenceClient, InferenceOutcome, RetryPolicy};
pub use render::{LatestComposite, NullSurface, RenderSurface};
pub use state::PipelineState;
pub use stats::{PipelineStats, StatsCounters, StatusSnapshot};
pub use types::{BoundingBox, DetectedObject, Detection};
