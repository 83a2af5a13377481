// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use rpicam::config::CaptureConfig;
use std::path::PathBuf;
use std::time::Duration;

mod cli;

#[derive(Parser)]
#[command(name = "rpicam")]
#[command(about = "Camera capture with hardware H.264 and JPEG encoders")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Configuration file (default: ~/.config/rpicam/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging and pipeline state dumps
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream encoded H.264 to a file or stdout
    Record {
        /// Output file, `-` or omitted for stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run time in milliseconds, 0 runs until Ctrl+C (default from config)
        #[arg(short = 't', long)]
        timeout: Option<u64>,

        /// Stop after this many encoded frames
        #[arg(short, long)]
        frames: Option<u64>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        /// Bits per second
        #[arg(short, long)]
        bitrate: Option<u32>,

        /// Frames per second
        #[arg(long)]
        framerate: Option<u32>,
    },

    /// Take one or more photos
    Photo {
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Directory for the images (default: ~/Pictures/rpicam)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Delay between photos in milliseconds
        #[arg(short, long, default_value = "1000")]
        interval: u64,
    },

    /// Cycle image effects and exposure modes on the preview
    Demo {
        /// Run time in milliseconds, 0 runs until Ctrl+C (default from config)
        #[arg(short = 't', long)]
        timeout: Option<u64>,

        /// Delay between steps in milliseconds
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Print the effective configuration as JSON
    Config {
        /// Also write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG overrides the default level, e.g. RUST_LOG=rpicam=trace
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();

    let mut config = CaptureConfig::load_or_default(cli.config.as_deref())?;
    config.verbose |= cli.verbose;

    match cli.command {
        Commands::Record {
            output,
            timeout,
            frames,
            width,
            height,
            bitrate,
            framerate,
        } => {
            let pipeline = &mut config.pipeline;
            if let Some(width) = width {
                pipeline.width = width;
            }
            if let Some(height) = height {
                pipeline.height = height;
            }
            if let Some(bitrate) = bitrate {
                pipeline.bitrate = bitrate;
            }
            if let Some(fps) = framerate {
                pipeline.framerate = rpicam::backends::types::Framerate::new(fps, 1);
            }
            if let Some(timeout) = timeout {
                config.timeout_ms = timeout;
            }
            cli::record(config, output, frames)
        }
        Commands::Photo {
            count,
            dir,
            interval,
        } => {
            if dir.is_some() {
                config.still.output_dir = dir;
            }
            cli::take_photos(config, count, Duration::from_millis(interval))
        }
        Commands::Demo { timeout, interval } => {
            if let Some(timeout) = timeout {
                config.timeout_ms = timeout;
            }
            if let Some(interval) = interval {
                config.demo_interval_ms = interval;
            }
            cli::run_demo(config)
        }
        Commands::Config { save } => cli::show_config(&config, cli.config, save),
    }
}
