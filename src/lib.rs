// SPDX-License-Identifier: MPL-2.0

//! Vision Monitor - live camera frames with asynchronous detection overlays
//!
//! This library provides the core of the `vision-monitor` application:
//! frame capture, a single-flight inference client, and an overlay
//! compositor that never draws detections onto frames they no longer match.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Frame sources (V4L2, synthetic, manual) and detector backends
//! - [`pipeline`]: Frame buffer, inference client, compositor and controller
//! - [`config`]: User configuration handling
//! - [`server`]: HTTP delivery of composites (MJPEG) and status (JSON)
//! - [`storage`]: Snapshot files
//! - [`terminal`]: Terminal monitor
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vision_monitor::{Config, LatestComposite, PipelineController};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let surface = Arc::new(LatestComposite::new());
//! let mut controller = PipelineController::from_config(&Config::default(), surface.clone())?;
//! controller.start()?;
//! // ... consume composites from `surface` ...
//! controller.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipeline;
pub mod server;
pub mod storage;
pub mod terminal;

// Re-export commonly used types
pub use config::Config;
pub use errors::{DeviceError, InferenceError, PipelineError, PipelineResult};
pub use pipeline::{
    Composite, Detection, LatestComposite, PipelineController, PipelineEvent, PipelineState,
    RenderSurface, StatusHandle, StatusSnapshot,
};
