// SPDX-License-Identifier: MPL-2.0

//! Backend abstraction layer for frame capture and detection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Pipeline Layer                 │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌─────────────────┐  ┌──────────────────┐  │
//! │  │     Camera      │  │    Inference     │  │
//! │  │ V4L2 / Synthetic│  │ Threshold /      │  │
//! │  │ / Manual        │  │ Process (stdio)  │  │
//! │  └─────────────────┘  └──────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`camera`]: Frame sources and the capture thread
//! - [`inference`]: Detector backends

pub mod camera;
pub mod inference;
