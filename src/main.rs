// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vision_monitor::constants::server::DEFAULT_ADDR;

mod cli;

#[derive(Parser)]
#[command(name = "vision-monitor")]
#[command(about = "Live camera monitor with asynchronous detection overlays")]
#[command(version = env!("GIT_VERSION"))]
#[command(subcommand_required = false)]
struct Cli {
    /// Config file (default: ~/.config/vision-monitor/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Frame source: "synthetic" or a V4L2 device path such as /dev/video0
    #[arg(short, long, global = true)]
    source: Option<String>,

    /// External detector command, e.g. "python3 detector.py"
    #[arg(long, global = true)]
    detector_cmd: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a headless session (default)
    Run {
        /// Stop after this many seconds (default: run until Ctrl+C)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Save the last composite as JPEG to this file or directory on exit
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Serve composites as MJPEG (/video) and status as JSON (/status)
    Serve {
        /// Listen address
        #[arg(short, long, default_value = DEFAULT_ADDR)]
        addr: String,

        /// Stop after this many seconds (default: run until Ctrl+C)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Run in terminal mode (renders composites to the terminal)
    Terminal,

    /// List available capture devices
    List,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=vision_monitor=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = cli::Overrides {
        config: cli.config,
        source: cli.source,
        detector_cmd: cli.detector_cmd,
    };

    match cli.command {
        Some(Commands::List) => cli::list_cameras(),
        Some(Commands::Config) => cli::print_config(&cli::load_config(&overrides)?),
        Some(Commands::Serve { addr, duration }) => {
            cli::serve(cli::load_config(&overrides)?, &addr, duration)
        }
        Some(Commands::Terminal) => vision_monitor::terminal::run(cli::load_config(&overrides)?),
        Some(Commands::Run { duration, snapshot }) => {
            cli::run_headless(cli::load_config(&overrides)?, duration, snapshot)
        }
        None => cli::run_headless(cli::load_config(&overrides)?, None, None),
    }
}
