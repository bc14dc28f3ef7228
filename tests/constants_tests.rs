// SPDX-License-Identifier: MPL-2.0

//! Integration tests for constants module

use vision_monitor::constants::{capture, inference, overlay};

#[test]
fn test_backoff_bounds_are_ordered() {
    // First delay must not exceed the cap
    assert!(inference::DEFAULT_BACKOFF_BASE <= inference::DEFAULT_BACKOFF_MAX);
    assert!((0.0..=1.0).contains(&inference::DEFAULT_JITTER));
}

#[test]
fn test_retry_budget_allows_an_attempt() {
    assert!(inference::DEFAULT_RETRY_BUDGET >= 1);
}

#[test]
fn test_overlay_defaults_are_drawable() {
    assert!(overlay::DEFAULT_LINE_WIDTH > 0);
    assert!((0.0..=1.0).contains(&overlay::DEFAULT_MIN_CONFIDENCE));
    assert_eq!(overlay::DEFAULT_COLOR[3], 0xFF, "Default color should be opaque");
    assert!((1..=100).contains(&overlay::JPEG_QUALITY));
}

#[test]
fn test_capture_defaults() {
    assert!(capture::DEFAULT_WIDTH > 0 && capture::DEFAULT_HEIGHT > 0);
    assert!(capture::DEFAULT_WIDTH <= capture::MAX_DIMENSION);
    assert!(capture::DEFAULT_HEIGHT <= capture::MAX_DIMENSION);
}
