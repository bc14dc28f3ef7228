// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Running a headless monitoring session
//! - Serving composites and status over HTTP
//! - Listing capture devices
//! - Printing the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use vision_monitor::backends::camera::list_devices;
use vision_monitor::config::{Config, DetectorSettings, SourceSettings};
use vision_monitor::constants::status::REPORT_INTERVAL;
use vision_monitor::pipeline::{LatestComposite, PipelineController, PipelineState};
use vision_monitor::server::MonitorServer;
use vision_monitor::storage;

/// Overrides given on the command line
#[derive(Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub source: Option<String>,
    pub detector_cmd: Option<String>,
}

/// Load the config file (or defaults) and apply command-line overrides
pub fn load_config(overrides: &Overrides) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::load_or_default(overrides.config.as_deref())?;

    if let Some(source) = &overrides.source {
        config.capture.source = match source.as_str() {
            "synthetic" => SourceSettings::Synthetic,
            device => SourceSettings::V4l2 {
                device: device.to_string(),
            },
        };
    }

    if let Some(cmd) = &overrides.detector_cmd {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        let command = parts.next().ok_or("--detector-cmd must not be empty")?;
        config.inference.detector = DetectorSettings::Process {
            command,
            args: parts.collect(),
        };
    }

    config.validate()?;
    Ok(config)
}

/// List V4L2 capture devices
pub fn list_cameras() -> Result<(), Box<dyn std::error::Error>> {
    let devices = list_devices();

    if devices.is_empty() {
        println!("No capture devices found.");
        println!("Use '--source synthetic' for the built-in test pattern.");
        return Ok(());
    }

    println!("Available capture devices:");
    println!();
    for (index, device) in devices.iter().enumerate() {
        println!("  [{}] {}", index, device.card);
        println!("      Path:   {}", device.path);
        println!("      Driver: {}", device.driver);
        println!();
    }

    Ok(())
}

/// Print the effective configuration as JSON
pub fn print_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Run a headless session
///
/// Runs for `duration` seconds, or until Ctrl+C when no duration is given.
/// Status lines go to stderr every few seconds; the final status is printed
/// to stdout as JSON.
pub fn run_headless(
    config: Config,
    duration: Option<u64>,
    snapshot: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let surface = Arc::new(LatestComposite::new());
    let mut controller = PipelineController::from_config(&config, surface.clone())?;

    {
        let _guard = runtime.enter();
        controller.start()?;
    }
    announce(&controller, duration);

    monitor(&controller, duration, true)?;
    runtime.block_on(controller.stop())?;

    if let Some(path) = snapshot {
        save_snapshot(&surface, &path)?;
    }

    println!("{}", serde_json::to_string_pretty(&controller.status())?);
    Ok(())
}

/// Run a session and serve it over HTTP
///
/// `/video` streams composites as MJPEG and `/status` returns the status
/// snapshot. Unlike `run`, a failed pipeline keeps serving so clients can
/// see the `failed` state.
pub fn serve(
    config: Config,
    addr: &str,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let surface = Arc::new(LatestComposite::new());
    let mut controller = PipelineController::from_config(&config, surface.clone())?;
    let mut server = MonitorServer::bind(addr, &surface, controller.status_handle())?;

    {
        let _guard = runtime.enter();
        controller.start()?;
    }
    let local = server.local_addr();
    eprintln!("Serving http://{}/video and http://{}/status", local, local);
    announce(&controller, duration);

    monitor(&controller, duration, false)?;
    runtime.block_on(controller.stop())?;
    server.shutdown();

    println!("{}", serde_json::to_string_pretty(&controller.status())?);
    Ok(())
}

fn announce(controller: &PipelineController, duration: Option<u64>) {
    let status = controller.status();
    eprintln!(
        "Monitoring {} with {} detector (session {})",
        status.source,
        status.backend,
        status.session_id.as_deref().unwrap_or("-")
    );
    match duration {
        Some(secs) => eprintln!("Running for {} seconds...", secs),
        None => eprintln!("Running... Press Ctrl+C to stop."),
    }
}

/// Block until Ctrl+C, the duration elapses or (optionally) the pipeline fails
fn monitor(
    controller: &PipelineController,
    duration: Option<u64>,
    stop_on_failure: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    let limit = duration.map(Duration::from_secs);
    let start = Instant::now();
    let mut last_report = Instant::now();
    let mut failure_reported = false;

    while !stop_flag.load(Ordering::SeqCst) {
        if limit.is_some_and(|limit| start.elapsed() >= limit) {
            break;
        }
        if controller.state() == PipelineState::Failed && !failure_reported {
            eprintln!("Pipeline failed: capture device lost");
            if stop_on_failure {
                break;
            }
            failure_reported = true;
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            report(controller);
            last_report = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn report(controller: &PipelineController) {
    let status = controller.status();
    let detection = match (&status.label, status.confidence) {
        (Some(label), Some(confidence)) => format!("{} ({:.2})", label, confidence),
        _ => "none".to_string(),
    };
    eprintln!(
        "\r[{}] frame {} | {:.1} fps | detection {} | busy {} | failed {}",
        status.state,
        status.latest_frame.unwrap_or(0),
        status.counters.fps,
        detection,
        status.counters.inference_busy,
        status.counters.inference_failed,
    );
}

fn save_snapshot(surface: &LatestComposite, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let Some(composite) = surface.latest() else {
        eprintln!("No frame captured, snapshot not written");
        return Ok(());
    };

    let path = if path.is_dir() {
        storage::timestamped_path(path)
    } else {
        path.to_path_buf()
    };
    storage::save_snapshot(&composite, &path)?;
    eprintln!("Snapshot saved to: {}", path.display());
    Ok(())
}
