// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for capture operations
//!
//! This module provides command-line functionality for:
//! - Recording the encoded H.264 stream
//! - Taking photos
//! - Running the camera settings demo
//!
//! Encoded video may go to stdout, so progress messages go to stderr.

use rpicam::backends::get_backend;
use rpicam::config::{CaptureConfig, OperatingMode};
use rpicam::errors::{CaptureError, StreamError};
use rpicam::pipelines::CapturePipeline;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a pull waits before the run limits are checked again
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Build the pipeline for `config` and stop it on Ctrl+C
fn open_pipeline(config: CaptureConfig) -> Result<Arc<CapturePipeline>, Box<dyn std::error::Error>> {
    let backend = get_backend(config.backend);
    let pipeline = Arc::new(CapturePipeline::setup(backend, config)?);

    let weak = Arc::downgrade(&pipeline);
    ctrlc::set_handler(move || {
        if let Some(pipeline) = weak.upgrade() {
            eprintln!();
            eprintln!("Stopping early...");
            pipeline.stop();
        }
    })?;

    Ok(pipeline)
}

fn open_output(output: Option<PathBuf>) -> io::Result<Box<dyn Write>> {
    match output {
        Some(path) if path != Path::new("-") => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            eprintln!("Output: {}", path.display());
            Ok(Box::new(BufWriter::new(File::create(path)?)))
        }
        _ => Ok(Box::new(io::stdout().lock())),
    }
}

#[derive(Debug, Default)]
struct RecordTotals {
    /// Pictures only; codec config buffers are written but not counted
    frames: u64,
    bytes: u64,
    degraded: u64,
}

/// Write encoded buffers to `sink` until the limit, the duration or a stop
fn pull_frames(
    pipeline: &CapturePipeline,
    sink: &mut dyn Write,
    frame_limit: Option<u64>,
    duration: Option<Duration>,
) -> Result<RecordTotals, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut totals = RecordTotals::default();

    while frame_limit.is_none_or(|limit| totals.frames < limit) {
        let wait = match duration {
            Some(duration) => match duration.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining.min(POLL_INTERVAL),
                _ => break,
            },
            None => POLL_INTERVAL,
        };

        match pipeline.fill_timeout(wait) {
            Ok(Some(filled)) => {
                if filled.resubmit_error.is_some() {
                    totals.degraded += 1;
                }
                sink.write_all(&filled.frame.data)?;
                if !filled.frame.is_config() {
                    totals.frames += 1;
                }
                totals.bytes += filled.frame.len() as u64;
            }
            Ok(None) => {}
            Err(StreamError::Stopped) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(totals)
}

/// Record the encoded stream until the timeout, the frame limit or Ctrl+C
pub fn record(
    config: CaptureConfig,
    output: Option<PathBuf>,
    frame_limit: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let duration = config.run_duration();
    let verbose = config.verbose;
    let p = &config.pipeline;
    eprintln!(
        "Recording format: {}x{} @ {} fps, {} bit/s",
        p.width, p.height, p.framerate, p.bitrate
    );

    let mut sink = open_output(output)?;
    let pipeline = open_pipeline(config)?;
    pipeline.start()?;
    if verbose {
        pipeline.dump_state();
    }

    let start = Instant::now();
    let totals = pull_frames(&pipeline, sink.as_mut(), frame_limit, duration)?;
    sink.flush()?;

    if verbose {
        pipeline.dump_state();
    }
    pipeline.shutdown()?;

    eprintln!(
        "Recorded {} frames ({} bytes) in {:.1}s",
        totals.frames,
        totals.bytes,
        start.elapsed().as_secs_f64()
    );
    if totals.degraded > 0 {
        eprintln!(
            "Warning: {} buffers could not be returned to the encoder",
            totals.degraded
        );
    }

    Ok(())
}

/// Take `count` photos, `interval` apart
pub fn take_photos(
    config: CaptureConfig,
    count: u32,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.mode == OperatingMode::Demo {
        return Err("Photos are not available in demo mode".into());
    }
    let verbose = config.verbose;
    println!("Saving to: {}", config.photo_dir().display());

    // Stills do not need the video stream running
    let pipeline = open_pipeline(config)?;

    for index in 0..count {
        if index > 0 {
            std::thread::sleep(interval);
        }
        println!("Capturing...");
        match pipeline.capture_photo() {
            Ok(path) => println!("Photo saved: {}", path.display()),
            Err(CaptureError::Aborted | CaptureError::NotStreaming) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if verbose {
        pipeline.dump_state();
    }
    pipeline.shutdown()?;
    Ok(())
}

/// Cycle camera settings on the preview until the timeout or Ctrl+C
pub fn run_demo(mut config: CaptureConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.mode = OperatingMode::Demo;
    match config.run_duration() {
        Some(duration) => println!("Demo mode for {:.1}s", duration.as_secs_f64()),
        None => println!("Demo mode (press Ctrl+C to stop)"),
    }

    let pipeline = open_pipeline(config)?;
    pipeline.start()?;
    let steps = pipeline.run_demo()?;
    pipeline.shutdown()?;

    println!("Demo finished after {} steps", steps);
    Ok(())
}

/// Print the effective configuration, optionally writing it back
pub fn show_config(
    config: &CaptureConfig,
    path: Option<PathBuf>,
    save: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config.to_json()?);

    if save {
        let path = path
            .or_else(CaptureConfig::default_path)
            .ok_or("No configuration directory available")?;
        config.save(&path)?;
        eprintln!("Configuration saved: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpicam::backends::simulated::payload::codec_config;
    use rpicam::backends::simulated::{SimulatedBackend, SimulatedConfig, SimulatedFrame};

    #[test]
    fn test_frame_limit_counts_pictures_only() {
        let backend = Arc::new(SimulatedBackend::new(SimulatedConfig {
            frame_interval: Some(Duration::ZERO),
            frame_limit: Some(10),
            drop_when_starved: false,
            ..SimulatedConfig::default()
        }));
        let pipeline = CapturePipeline::setup(backend, CaptureConfig::default()).unwrap();
        pipeline.start().unwrap();

        let mut sink = Vec::new();
        let totals = pull_frames(&pipeline, &mut sink, Some(3), None).unwrap();
        assert_eq!(totals.frames, 3);
        assert_eq!(totals.bytes, sink.len() as u64);

        // Codec config first, then exactly three pictures
        let config = codec_config(640, 480);
        let mut offset = config.len();
        let mut pictures = Vec::new();
        assert_eq!(sink[4], config[4]);
        while offset < sink.len() {
            let header = SimulatedFrame::parse(&sink[offset..]).unwrap();
            pictures.push(header.seq);
            offset += header.length;
        }
        assert_eq!(pictures, vec![0, 1, 2]);
        pipeline.shutdown().unwrap();
    }
}
