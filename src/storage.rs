// SPDX-License-Identifier: MPL-2.0

//! Storage utilities for composite snapshots

use crate::constants::APP_NAME;
use crate::constants::overlay::JPEG_QUALITY;
use crate::pipeline::compositor::Composite;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default snapshot directory: `~/Pictures/vision-monitor`, or the working
/// directory when there is no pictures directory
pub fn default_snapshot_dir() -> PathBuf {
    dirs::picture_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Timestamped snapshot file name inside `dir`
pub fn timestamped_path(dir: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
    dir.join(format!("snapshot_{}.jpg", timestamp))
}

/// Encode `composite` (with its overlay) as JPEG and write it to `path`
///
/// Parent directories are created as needed.
pub fn save_snapshot(composite: &Composite, path: &Path) -> io::Result<()> {
    let bytes = composite.encode_jpeg(JPEG_QUALITY).map_err(io::Error::other)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &bytes)?;

    info!(
        path = %path.display(),
        sequence = composite.sequence(),
        bytes = bytes.len(),
        "Snapshot saved"
    );
    Ok(())
}
